//! Primary/alternate model fallback on top of [`RetryExecutor`].
use crate::errors::GenerationError;
use crate::executor::RetryExecutor;
use crate::provider::{Generation, GenerationRequest};
use bon::Builder;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Builder)]
pub struct FallbackPolicy {
    /// Model tried when the primary fails.
    #[builder(into)]
    pub alternate_model: Option<String>,
    #[builder(default = 3)]
    pub primary_attempts: u32,
    #[builder(default = 2)]
    pub alternate_attempts: u32,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone)]
pub struct ModelFallbackRouter {
    executor: RetryExecutor,
    policy: FallbackPolicy,
}

impl ModelFallbackRouter {
    pub fn new(executor: RetryExecutor, policy: FallbackPolicy) -> Self {
        Self { executor, policy }
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    /// Run `request` against its own model, falling back to the configured alternate.
    pub async fn execute(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        self.execute_with_fallback(request, self.policy.alternate_model.as_deref())
            .await
    }

    /// Run `request` against `request.model`; on failure try `alternate` if it is set, differs
    /// from the primary, and is not cooling down. When the alternate fails too, the primary's
    /// error is returned.
    #[instrument(skip(self, request), fields(primary = %request.model))]
    pub async fn execute_with_fallback(
        &self,
        request: &GenerationRequest,
        alternate: Option<&str>,
    ) -> Result<Generation, GenerationError> {
        let primary_error = match self
            .executor
            .execute(request, self.policy.primary_attempts)
            .await
        {
            Ok(generation) => return Ok(generation),
            Err(error) => error,
        };

        let cooldowns = self.executor.cooldowns();
        let primary_error =
            primary_error.with_retry_hint(cooldowns.remaining(&request.model));

        let Some(alternate) = alternate.filter(|alt| *alt != request.model) else {
            return Err(primary_error);
        };
        if cooldowns.is_on_cooldown(alternate) {
            info!(alternate = %alternate, "Alternate model cooling down, not falling back");
            return Err(primary_error);
        }

        warn!(
            alternate = %alternate,
            error = %primary_error,
            "Primary model failed, falling back"
        );
        match self
            .executor
            .execute(&request.for_model(alternate), self.policy.alternate_attempts)
            .await
        {
            Ok(generation) => Ok(generation),
            Err(alternate_error) => {
                warn!(alternate = %alternate, error = %alternate_error, "Alternate model failed too");
                Err(primary_error)
            }
        }
    }
}
