//! One logical generation call: cooldown check, admission, then a bounded retry loop.
//!
//! The admission permit is held for the whole call, backoff sleeps included, so the number of
//! logical calls in flight against the provider never exceeds the gate's budget. The cooldown is
//! checked again once the permit is held and after every backoff sleep. Only a cooldown this call
//! set itself through repeated overloads is allowed to be retried through.
use crate::admission::AdmissionGate;
use crate::cooldown::CooldownRegistry;
use crate::errors::GenerationError;
use crate::provider::{Generation, GenerationRequest, Provider};
use crate::retry::{BackoffPolicy, ErrorClass, classify};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    provider: Arc<dyn Provider>,
    cooldowns: Arc<CooldownRegistry>,
    gate: Arc<AdmissionGate>,
    backoff: BackoffPolicy,
}

impl RetryExecutor {
    pub fn new(
        provider: Arc<dyn Provider>,
        cooldowns: Arc<CooldownRegistry>,
        gate: Arc<AdmissionGate>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            provider,
            cooldowns,
            gate,
            backoff,
        }
    }

    pub fn cooldowns(&self) -> &Arc<CooldownRegistry> {
        &self.cooldowns
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    /// Run `request` with at most `max_attempts` provider calls.
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn execute(
        &self,
        request: &GenerationRequest,
        max_attempts: u32,
    ) -> Result<Generation, GenerationError> {
        let model = request.model.as_str();

        if let Some(retry_after) = self.cooldowns.remaining(model) {
            debug!(retry_after_ms = retry_after.as_millis() as u64, "Model on cooldown, not calling provider");
            return Err(GenerationError::CooldownActive {
                model: model.to_owned(),
                retry_after,
            });
        }

        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| GenerationError::Fatal {
                model: model.to_owned(),
                message: format!("admission unavailable: {e}"),
            })?;

        // Another call may have set a cooldown while this one queued for admission.
        let admitted = self.cooldowns.snapshot(model);
        if let Some(retry_after) = admitted.remaining {
            debug!(retry_after_ms = retry_after.as_millis() as u64, "Model went on cooldown while waiting for admission");
            return Err(GenerationError::CooldownActive {
                model: model.to_owned(),
                retry_after,
            });
        }

        let max_attempts = max_attempts.max(1);
        let mut known_epoch = admitted.epoch;
        let mut foreign_cooldown = false;
        let mut backoff_step = 0;
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let current = self.cooldowns.snapshot(model);
                foreign_cooldown |= current.epoch != known_epoch;
                if foreign_cooldown && let Some(retry_after) = current.remaining {
                    info!(
                        attempt,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Model put on cooldown by another call, abandoning retries"
                    );
                    return Err(GenerationError::CooldownActive {
                        model: model.to_owned(),
                        retry_after,
                    });
                }
            }

            attempt += 1;
            let error = match self.provider.generate(request).await {
                Ok(text) => {
                    self.cooldowns.record_success(model);
                    debug!(attempt, "Generation succeeded");
                    return Ok(Generation {
                        model: model.to_owned(),
                        text,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            match classify(&error) {
                ErrorClass::QuotaExceeded => {
                    self.cooldowns.set_cooldown(model, error.retry_after);
                    let retry_after = self
                        .cooldowns
                        .remaining(model)
                        .unwrap_or(Duration::ZERO);
                    warn!(
                        attempt,
                        cooldown_ms = retry_after.as_millis() as u64,
                        error = %error,
                        "Quota exhausted"
                    );
                    return Err(GenerationError::QuotaExceeded {
                        model: model.to_owned(),
                        message: error.message,
                        retry_after,
                    });
                }
                ErrorClass::Fatal => {
                    warn!(attempt, error = %error, "Non-retryable provider error");
                    return Err(GenerationError::Fatal {
                        model: model.to_owned(),
                        message: error.message,
                    });
                }
                ErrorClass::Transient => {
                    let overload = self.cooldowns.record_overload(model);
                    foreign_cooldown |= overload.epoch_before != known_epoch;
                    known_epoch = overload.epoch_after;
                    let streak = overload.streak;

                    if attempt >= max_attempts {
                        warn!(attempt, streak, error = %error, "Retries exhausted");
                        return Err(GenerationError::Transient {
                            model: model.to_owned(),
                            retry_after: error
                                .retry_after
                                .or_else(|| self.cooldowns.remaining(model)),
                            message: error.message,
                            attempts: attempt,
                        });
                    }

                    // A provider hint replaces the computed delay and leaves the curve where it was.
                    let delay = match error.retry_after {
                        Some(hint) => hint,
                        None => {
                            backoff_step += 1;
                            self.backoff.delay_for_step(backoff_step)
                        }
                    };
                    info!(
                        attempt,
                        streak,
                        delay_ms = delay.as_millis() as u64,
                        hinted = error.retry_after.is_some(),
                        error = %error,
                        "Transient provider error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
