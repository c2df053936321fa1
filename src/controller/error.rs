//! Error types for the AppHook controller

use std::time::Duration;

use thiserror::Error;

use crate::driver::DriverError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    /// Spec or credential problem that needs a user change
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Driver error: {0}")]
    DriverError(#[from] DriverError),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx is permanent except Conflict and TooManyRequests
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::DriverError(e) => e.is_retryable(),
            Error::TransientError(_) => true,
            Error::InvalidConfig(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }

    /// Whether the object disappeared underneath the reconcile
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(api_err)) if api_err.code == 404)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Delay for the given retry attempt, jittered and capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Larger exponents overflow to infinity and poison the jitter math
        let exponent = attempt.min(32) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_delay)
    }
}

/// Consecutive error tracking for one AppHook
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    pub consecutive_errors: u32,
}

impl ErrorContext {
    pub fn record_error(&mut self) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
    }
}
