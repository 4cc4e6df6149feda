//! Provider failure taxonomy and retry bookkeeping.
//!
//! Every provider failure is either [`ProviderError::Transient`] (retry with
//! backoff) or [`ProviderError::Fatal`] (surface immediately). The `status`
//! field always carries an HTTP-style code, even for non-HTTP transports,
//! so classification is uniform:
//!
//! - 429 and 5xx → transient
//! - any other non-success status → fatal
//! - timeout → transient (504), connection failure → transient (503)
//! - malformed payload → fatal (200: the exchange worked, the body did not)

use std::time::Duration;

use thiserror::Error;

/// Timeout surfaced as a transient failure.
pub const STATUS_TIMEOUT: u16 = 504;
/// Connection refused / reset / DNS failure.
pub const STATUS_UNAVAILABLE: u16 = 503;
/// Response arrived but could not be decoded.
pub const STATUS_MALFORMED: u16 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("transient provider error ({status}): {message}")]
    Transient {
        message: String,
        status: u16,
        retry_after_ms: Option<u64>,
    },
    #[error("fatal provider error ({status}): {message}")]
    Fatal { message: String, status: u16 },
}

impl ProviderError {
    pub fn transient(status: u16, message: impl Into<String>) -> Self {
        ProviderError::Transient {
            message: message.into(),
            status,
            retry_after_ms: None,
        }
    }

    pub fn fatal(status: u16, message: impl Into<String>) -> Self {
        ProviderError::Fatal {
            message: message.into(),
            status,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::transient(STATUS_TIMEOUT, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::fatal(STATUS_MALFORMED, message)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    pub fn status(&self) -> u16 {
        match self {
            ProviderError::Transient { status, .. } | ProviderError::Fatal { status, .. } => *status,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Transient { message, .. } | ProviderError::Fatal { message, .. } => {
                message
            }
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Transient {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

/// Classify a non-success status code.
pub fn classify_status(
    status: u16,
    message: impl Into<String>,
    retry_after_ms: Option<u64>,
) -> ProviderError {
    if status == 429 || (500..=599).contains(&status) {
        ProviderError::Transient {
            message: message.into(),
            status,
            retry_after_ms,
        }
    } else {
        ProviderError::fatal(status, message)
    }
}

/// Classify a transport-level `reqwest` failure.
pub fn classify_reqwest(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        return ProviderError::timeout(err.to_string());
    }
    if err.is_decode() {
        return ProviderError::malformed(err.to_string());
    }
    if let Some(status) = err.status() {
        return classify_status(status.as_u16(), err.to_string(), None);
    }
    ProviderError::transient(STATUS_UNAVAILABLE, err.to_string())
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(value: Option<&str>) -> Option<u64> {
    let secs: f64 = value?.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some((secs * 1000.0) as u64)
    } else {
        None
    }
}

/// Backoff schedule for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub add_jitter: bool,
    /// Per-request timeout around `embed_batch`.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based). A server-provided
    /// `retry_after` wins over the computed delay; both are capped.
    pub fn backoff_for_attempt(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_backoff);
        }

        let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let mut backoff = Duration::from_secs_f64(base.min(self.max_backoff.as_secs_f64()));

        if self.add_jitter {
            // up to 25%
            let jitter_factor = 1.0 + rand::random::<f64>() * 0.25;
            backoff = Duration::from_secs_f64(backoff.as_secs_f64() * jitter_factor);
        }

        backoff.min(self.max_backoff)
    }
}

/// Caps consecutive deferrals of work that kept failing transiently.
#[derive(Debug, Clone)]
pub struct DeferralCounter {
    max: u32,
    consecutive: u32,
}

impl DeferralCounter {
    pub const DEFAULT_MAX: u32 = 20;

    pub fn new(max: u32) -> Self {
        Self {
            max,
            consecutive: 0,
        }
    }

    /// Record one more deferral. Returns `false` once the cap is reached.
    pub fn defer(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive < self.max
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn count(&self) -> u32 {
        self.consecutive
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

impl Default for DeferralCounter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX)
    }
}
