use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::SyncwireResult;
use crate::error::Error;

const DEFAULT_MAX_ATTEMPTS: usize = 15;
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_MULTIPLIER: Duration = Duration::from_millis(300);

/// Message fragments the server uses for failures that no retry can fix.
///
/// These are matched as substrings of the server's error message, which ties
/// retry behavior to message wording on the server side.
// TODO: switch to structured error codes once the server sends them alongside the message.
pub const DEFAULT_FATAL_MESSAGE_FRAGMENTS: &[&str] = &["insufficient storage", "sync session"];

pub trait RecoverabilityClassifier: Send + Sync {
    fn is_recoverable(&self, error: &Error) -> bool;
}

#[derive(Clone, Debug)]
pub struct DefaultRecoverability {
    fatal_message_fragments: Vec<String>,
}

impl Default for DefaultRecoverability {
    fn default() -> Self {
        Self {
            fatal_message_fragments: DEFAULT_FATAL_MESSAGE_FRAGMENTS
                .iter()
                .map(|fragment| (*fragment).to_owned())
                .collect(),
        }
    }
}

impl DefaultRecoverability {
    pub fn fatal_message_fragments<I, S>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fatal_message_fragments = fragments
            .into_iter()
            .map(|fragment| fragment.into().to_ascii_lowercase())
            .collect();
        self
    }

    fn has_fatal_message(&self, message: &str) -> bool {
        let message = message.to_ascii_lowercase();
        self.fatal_message_fragments
            .iter()
            .any(|fragment| message.contains(fragment.as_str()))
    }
}

impl RecoverabilityClassifier for DefaultRecoverability {
    fn is_recoverable(&self, error: &Error) -> bool {
        if matches!(error, Error::ServerUnavailable { .. }) {
            return true;
        }
        if !error.is_server_response() {
            return true;
        }
        if matches!(
            error,
            Error::AuthInvalid { .. } | Error::AuthExpired { .. } | Error::VersionIncompatible { .. }
        ) {
            return false;
        }
        if error
            .status()
            .is_some_and(|status| (400..500).contains(&status))
        {
            return false;
        }
        if let Some(message) = error.server_message()
            && self.has_fatal_message(message)
        {
            return false;
        }
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    max_attempts: usize,
    max_wait: Duration,
    multiplier: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: usize, max_wait: Duration, multiplier: Duration) -> SyncwireResult<Self> {
        if max_attempts < 1 {
            return Err(Error::InvalidBackoffPolicy {
                reason: format!("max_attempts must be at least 1, got {max_attempts}"),
            });
        }
        Ok(Self {
            max_attempts,
            max_wait,
            multiplier,
        })
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn multiplier(&self) -> Duration {
        self.multiplier
    }

    pub fn state(&self) -> BackoffState {
        BackoffState::new(*self)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_wait: DEFAULT_MAX_WAIT,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

/// Fibonacci-shaped wait sequence, seeded at `(0, 0)` and floored at one unit.
#[derive(Clone, Debug)]
pub struct BackoffState {
    policy: BackoffPolicy,
    attempt: usize,
    prev_units: u64,
    prev_prev_units: u64,
}

impl BackoffState {
    fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            prev_units: 0,
            prev_prev_units: 0,
        }
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let units = self
            .prev_units
            .saturating_add(self.prev_prev_units)
            .max(1);
        self.prev_prev_units = self.prev_units;
        self.prev_units = units;
        self.attempt += 1;

        let multiplier_ms = self.policy.multiplier.as_millis().min(u64::MAX as u128) as u64;
        let max_wait_ms = self.policy.max_wait.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(units.saturating_mul(multiplier_ms).min(max_wait_ms))
    }
}

pub async fn retry_with_backoff<T, F, Fut>(
    policy: BackoffPolicy,
    classifier: &dyn RecoverabilityClassifier,
    mut operation: F,
) -> SyncwireResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncwireResult<T>>,
{
    let mut state = policy.state();
    let mut attempt = 1_usize;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) => {
                if !classifier.is_recoverable(&error) {
                    debug!(error = %error, "not retrying unrecoverable error");
                    return Err(error);
                }
                if attempt >= policy.max_attempts {
                    return Err(error);
                }
                let delay = state.next_delay();
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after recoverable error"
                );
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

pub(crate) fn default_classifier() -> Arc<dyn RecoverabilityClassifier> {
    Arc::new(DefaultRecoverability::default())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use http::Method;

    use super::{BackoffPolicy, DefaultRecoverability, RecoverabilityClassifier, retry_with_backoff};
    use crate::error::Error;

    fn unavailable() -> Error {
        Error::ServerUnavailable {
            hint: "server is unavailable".to_owned(),
            method: Method::GET,
            uri: "http://127.0.0.1:1/api".to_owned(),
            source: Arc::new(std::io::Error::other("connection refused")),
        }
    }

    fn server_error(status: u16, message: &str) -> Error {
        Error::ServerResponse {
            status,
            message: message.to_owned(),
            body: String::new(),
        }
    }

    #[test]
    fn delay_sequence_is_fibonacci_and_capped() {
        let policy = BackoffPolicy::new(20, Duration::from_millis(10_000), Duration::from_millis(300))
            .expect("policy should be valid");
        let mut state = policy.state();
        let delays = (0..12)
            .map(|_| state.next_delay().as_millis())
            .collect::<Vec<_>>();

        assert_eq!(
            delays,
            vec![300, 300, 600, 900, 1500, 2400, 3900, 6300, 10_000, 10_000, 10_000, 10_000]
        );
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= 10_000));
    }

    #[test]
    fn zero_attempts_is_rejected_before_running() {
        let error = BackoffPolicy::new(0, Duration::from_secs(1), Duration::from_millis(1))
            .expect_err("zero attempts should be rejected");
        assert!(matches!(error, Error::InvalidBackoffPolicy { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_exactly_max_then_returns_last_error() {
        let policy = BackoffPolicy::new(4, Duration::from_millis(10_000), Duration::from_millis(300))
            .expect("policy should be valid");
        let calls = AtomicUsize::new(0);

        let result: Result<(), Error> =
            retry_with_backoff(policy, &DefaultRecoverability::default(), || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(server_error(503, &format!("busy {call}"))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.expect_err("should fail after exhausting attempts") {
            Error::ServerResponse { status, message, .. } => {
                assert_eq!(status, 503);
                assert_eq!(message, "busy 4");
            }
            other => panic!("unexpected error variant: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_error_is_not_retried() {
        let policy = BackoffPolicy::default();
        let calls = AtomicUsize::new(0);

        let result: Result<(), Error> =
            retry_with_backoff(policy, &DefaultRecoverability::default(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::NotFound { message: "gone".to_owned() }) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_unavailable_server() {
        let policy = BackoffPolicy::default();
        let calls = AtomicUsize::new(0);

        let value = retry_with_backoff(policy, &DefaultRecoverability::default(), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 { Err(unavailable()) } else { Ok(call) }
            }
        })
        .await
        .expect("third attempt should succeed");

        assert_eq!(value, 2);
    }

    #[test]
    fn classifier_matches_documented_rules() {
        let classifier = DefaultRecoverability::default();

        assert!(classifier.is_recoverable(&unavailable()));
        assert!(classifier.is_recoverable(&server_error(500, "boom")));
        assert!(classifier.is_recoverable(&Error::Timeout {
            timeout_ms: 10,
            method: Method::GET,
            uri: "http://example.test".to_owned(),
        }));
        assert!(!classifier.is_recoverable(&server_error(422, "bad input")));
        assert!(!classifier.is_recoverable(&Error::AuthExpired {
            message: "expired".to_owned(),
        }));
        assert!(!classifier.is_recoverable(&Error::AuthInvalid {
            message: "bad password".to_owned(),
        }));
        assert!(!classifier.is_recoverable(&Error::VersionIncompatible {
            message: "too old".to_owned(),
        }));
        assert!(!classifier.is_recoverable(&Error::ResourceConflict {
            message: "conflict".to_owned(),
        }));
        assert!(!classifier.is_recoverable(&server_error(507, "Insufficient storage on device")));
        assert!(!classifier.is_recoverable(&server_error(
            500,
            "Sync session abc has already ended"
        )));
    }

    #[test]
    fn fatal_fragments_are_configurable() {
        let classifier = DefaultRecoverability::default().fatal_message_fragments(["Disk Full"]);

        assert!(!classifier.is_recoverable(&server_error(500, "disk full on host")));
        assert!(classifier.is_recoverable(&server_error(500, "insufficient storage")));
    }
}
