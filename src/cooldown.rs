//! Per-model cooldowns.
//!
//! A cooldown is a deadline before which a model must not be called at all. Entries are only
//! ever extended and are never deleted: once the deadline passes the entry is simply stale.
//! The registry also counts consecutive overload failures per model so that a backend which
//! keeps answering "overloaded" gets a cooldown even when it never sends a retry hint.
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Cooldown applied when the provider reports exhaustion without a retry hint.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Cooldown applied after repeated overload failures.
pub const OVERLOAD_COOLDOWN: Duration = Duration::from_secs(120);

/// Consecutive overload failures that trigger [`OVERLOAD_COOLDOWN`].
pub const OVERLOAD_STREAK_THRESHOLD: u32 = 2;

#[derive(Debug, Default)]
struct ModelHealth {
    cooldown_until: Option<Instant>,
    overload_streak: u32,
    /// Bumped on every cooldown write, whether or not it moved the deadline.
    epoch: u64,
}

impl ModelHealth {
    fn extend(&mut self, until: Instant) -> Instant {
        let effective = match self.cooldown_until {
            Some(existing) if existing >= until => existing,
            _ => until,
        };
        self.cooldown_until = Some(effective);
        self.epoch += 1;
        effective
    }
}

/// The model's cooldown as seen at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownSnapshot {
    pub remaining: Option<Duration>,
    /// Number of cooldown writes the model has seen so far.
    pub epoch: u64,
}

/// Outcome of [`CooldownRegistry::record_overload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverloadRecord {
    pub streak: u32,
    /// Cooldown epoch before this failure was recorded.
    pub epoch_before: u64,
    /// Cooldown epoch afterwards. Differs from `epoch_before` when the failure set a cooldown.
    pub epoch_after: u64,
}

impl OverloadRecord {
    pub fn set_cooldown(&self) -> bool {
        self.epoch_after != self.epoch_before
    }
}

#[derive(Debug)]
pub struct CooldownRegistry {
    entries: DashMap<String, ModelHealth>,
    default_cooldown: Duration,
    overload_cooldown: Duration,
}

impl Default for CooldownRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN, OVERLOAD_COOLDOWN)
    }
}

impl CooldownRegistry {
    pub fn new(default_cooldown: Duration, overload_cooldown: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_cooldown,
            overload_cooldown,
        }
    }

    pub fn is_on_cooldown(&self, model: &str) -> bool {
        self.remaining(model).is_some()
    }

    /// Time left on the model's cooldown, or `None` if it may be called now.
    pub fn remaining(&self, model: &str) -> Option<Duration> {
        self.snapshot(model).remaining
    }

    /// Remaining cooldown together with the write epoch, read under one lock.
    pub fn snapshot(&self, model: &str) -> CooldownSnapshot {
        let Some(entry) = self.entries.get(model) else {
            return CooldownSnapshot {
                remaining: None,
                epoch: 0,
            };
        };
        let now = Instant::now();
        CooldownSnapshot {
            remaining: entry
                .cooldown_until
                .filter(|until| *until > now)
                .map(|until| until - now),
            epoch: entry.epoch,
        }
    }

    /// Put `model` on cooldown for `hint`, or for the default duration when there is none.
    ///
    /// Returns the deadline in force afterwards, which is later than the requested one when an
    /// existing cooldown already reaches further.
    pub fn set_cooldown(&self, model: &str, hint: Option<Duration>) -> Instant {
        let duration = hint.unwrap_or(self.default_cooldown);
        self.set_cooldown_until(model, Instant::now() + duration)
    }

    /// Extend the model's cooldown to `until`. Never shortens an existing cooldown.
    pub fn set_cooldown_until(&self, model: &str, until: Instant) -> Instant {
        let effective = self.entries.entry(model.to_owned()).or_default().extend(until);
        debug!(
            model = %model,
            remaining_ms = effective.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Cooldown set"
        );
        effective
    }

    /// Record a transient overload failure.
    ///
    /// From the [`OVERLOAD_STREAK_THRESHOLD`]th consecutive failure onwards the model is put on the
    /// overload cooldown as well. The streak and the cooldown are updated under one entry lock, so
    /// the returned epochs tell the caller whether anyone else wrote a cooldown in between.
    pub fn record_overload(&self, model: &str) -> OverloadRecord {
        let record = {
            let mut entry = self.entries.entry(model.to_owned()).or_default();
            let epoch_before = entry.epoch;
            entry.overload_streak = entry.overload_streak.saturating_add(1);
            if entry.overload_streak >= OVERLOAD_STREAK_THRESHOLD {
                entry.extend(Instant::now() + self.overload_cooldown);
            }
            OverloadRecord {
                streak: entry.overload_streak,
                epoch_before,
                epoch_after: entry.epoch,
            }
        };

        if record.set_cooldown() {
            warn!(model = %model, streak = record.streak, "Repeated overload, applying cooldown");
        }
        record
    }

    /// Reset the overload streak after a successful call. Cooldowns are left untouched.
    pub fn record_success(&self, model: &str) {
        if let Some(mut entry) = self.entries.get_mut(model) {
            entry.overload_streak = 0;
        }
    }
}
