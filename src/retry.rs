use std::time::Duration;

use crate::types::PhaseDefinition;

/// Pipeline-wide defaults a `RetryStrategy` falls back to when a phase
/// doesn't override them.
#[derive(Clone, Debug)]
pub struct RetryDefaults {
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub escalate_provider: Option<String>,
    pub escalate_after: Option<u32>,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        RetryDefaults {
            max_retries: 3,
            backoff_factor: 1.0,
            escalate_provider: None,
            escalate_after: None,
        }
    }
}

/// The resolved, per-phase retry policy a pipeline attempt consults every
/// iteration of the worker/reviewer loop.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub base_timeout: Duration,
    pub escalate_provider: Option<String>,
    /// Attempt number after which `escalate_provider` takes over. `0` means
    /// escalate from the first attempt.
    pub escalate_after: u32,
}

impl RetryStrategy {
    /// `phase.timeout_secs == 0` means no deadline regardless of backoff.
    pub fn effective_timeout(&self, attempt: u32) -> Duration {
        if self.base_timeout.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.backoff_factor.powi((attempt.max(1) - 1) as i32);
        Duration::from_secs_f64(self.base_timeout.as_secs_f64() * factor)
    }

    /// The provider name to use on the given attempt, or `None` to use the
    /// phase's own default provider.
    pub fn provider_for_attempt<'a>(&'a self, attempt: u32) -> Option<&'a str> {
        match &self.escalate_provider {
            Some(name) if attempt > self.escalate_after => Some(name.as_str()),
            _ => None,
        }
    }
}

pub fn resolve_retry_strategy(phase: &PhaseDefinition, defaults: &RetryDefaults) -> RetryStrategy {
    let max_attempts = if phase.max_retries > 0 {
        phase.max_retries
    } else if defaults.max_retries > 0 {
        defaults.max_retries
    } else {
        3
    };

    let escalate_after = defaults
        .escalate_after
        .unwrap_or_else(|| max_attempts.saturating_sub(1));

    RetryStrategy {
        max_attempts,
        backoff_factor: defaults.backoff_factor,
        base_timeout: phase.timeout(),
        escalate_provider: defaults.escalate_provider.clone(),
        escalate_after,
    }
}
