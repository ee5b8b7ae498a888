//! Credit checks for billable features.
//!
//! The HTTP layer consults the gate before orchestrating anything. A synchronous generation is
//! charged by the handler once it has succeeded; a queued one is charged by whichever queue
//! backend runs it to completion. Generation itself never sees credits.

use async_trait::async_trait;
use std::fmt;

/// Feature name every generation is checked and charged under.
pub const GENERATION_FEATURE: &str = "generation";

/// Error type for credit gate operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum CreditError {
    /// The billing backend could not be reached or answered nonsense
    #[error("Credit backend error: {0}")]
    Backend(String),
}

/// Balance checks per client and feature.
///
/// # Example
///
/// ```ignore
/// use genqueue::traits::{CreditError, CreditGate};
/// use async_trait::async_trait;
/// use dashmap::DashMap;
///
/// struct PrepaidCredits {
///     balances: DashMap<String, u64>,
/// }
///
/// #[async_trait]
/// impl CreditGate for PrepaidCredits {
///     async fn has_balance(&self, client: &str, _feature: &str) -> Result<bool, CreditError> {
///         Ok(self.balances.get(client).is_some_and(|b| *b > 0))
///     }
///
///     async fn deduct(&self, client: &str, _feature: &str) -> Result<(), CreditError> {
///         if let Some(mut balance) = self.balances.get_mut(client) {
///             *balance = balance.saturating_sub(1);
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait CreditGate: Send + Sync + fmt::Debug {
    /// Whether `client` can currently afford `feature`.
    async fn has_balance(&self, client: &str, feature: &str) -> Result<bool, CreditError>;

    /// Charge `client` for one use of `feature`.
    async fn deduct(&self, client: &str, feature: &str) -> Result<(), CreditError>;
}

/// Gate that lets everything through and charges nothing.
///
/// This is the default when no billing backend is configured.
#[derive(Debug, Clone, Default)]
pub struct NoOpCreditGate;

#[async_trait]
impl CreditGate for NoOpCreditGate {
    async fn has_balance(&self, _client: &str, _feature: &str) -> Result<bool, CreditError> {
        Ok(true)
    }

    async fn deduct(&self, client: &str, feature: &str) -> Result<(), CreditError> {
        tracing::trace!(client = %client, feature = %feature, "NoOpCreditGate: nothing to deduct");
        Ok(())
    }
}
