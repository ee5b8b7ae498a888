use super::{Job, JobStore, QueueError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

/// [`JobStore`] on Redis: one JSON string per job plus a list of pending ids.
///
/// Every save refreshes the record's TTL, so a record expires once it has gone unwritten for
/// the retention period.
///
/// Ids are `LPUSH`ed and `RPOP`ed, which keeps the list FIFO. Popping never blocks, so the
/// multiplexed connection stays free for the request path.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    prefix: String,
    ttl: Duration,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(error: redis::RedisError) -> Self {
        QueueError::Backend(error.to_string())
    }
}

impl RedisJobStore {
    /// Open a managed connection and make sure the server answers.
    pub async fn connect(url: &str, prefix: &str, ttl: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %pong, "Redis answered probe");
        Ok(Self {
            conn,
            prefix: prefix.to_owned(),
            ttl,
        })
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        let body = serde_json::to_string(job).map_err(|e| QueueError::Corrupt {
            id: job.id().to_owned(),
            reason: e.to_string(),
        })?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.job_key(job.id()))
            .arg(body)
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let body: Option<String> = redis::cmd("GET")
            .arg(self.job_key(id))
            .query_async(&mut conn)
            .await?;
        body.map(|body| {
            serde_json::from_str(&body).map_err(|e| QueueError::Corrupt {
                id: id.to_owned(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    async fn push(&self, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(self.pending_key())
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = redis::cmd("RPOP")
            .arg(self.pending_key())
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }
}
