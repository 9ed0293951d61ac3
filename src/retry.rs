//! Retry classification and backoff schedule
//!
//! [`IsRetryable`] decides which failures are worth another attempt, and
//! [`Backoff`] yields the delays between attempts. The transfer loop in
//! [`crate::downloader`] combines the two with resume data handling.
//!
//! # Example
//!
//! ```
//! use attachment_dl::config::RetryConfig;
//! use attachment_dl::retry::Backoff;
//! use std::time::Duration;
//!
//! let mut backoff = Backoff::new(&RetryConfig::default());
//! assert_eq!(backoff.next_delay(), Duration::from_millis(250));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(250));
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, connection reset) should return `true`.
/// Permanent failures (oversize, bad request path, corrupt data) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network { .. } | Error::Timeout { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            // The server answered; asking again will not change the answer
            Error::HttpStatus { .. } => false,
            // Size guard tripped, possibly by a hostile server
            Error::Oversize { .. } => false,
            Error::Protocol(_) => false,
            Error::Cancelled | Error::ShuttingDown => false,
            Error::Decryption(_) | Error::Validation(_) => false,
            Error::Config { .. } | Error::Serialization(_) => false,
        }
    }
}

/// Delay schedule derived from a [`RetryConfig`]
///
/// Starts at `initial_delay`, multiplies by `backoff_multiplier` after each
/// step and never exceeds `max_delay`. Jitter, when enabled, stretches each
/// delay by up to 100%.
#[derive(Clone, Debug)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    /// Schedule starting at the configured initial delay
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            delay: config.initial_delay.min(config.max_delay),
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        let scaled = current.as_secs_f64() * self.multiplier.max(0.0);
        // Saturate at max_delay when the product no longer fits a Duration
        self.delay = Duration::try_from_secs_f64(scaled)
            .map_or(self.max_delay, |next| next.min(self.max_delay));

        if self.jitter {
            add_jitter(current)
        } else {
            current
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor)).unwrap_or(delay)
}
