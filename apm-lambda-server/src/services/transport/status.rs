use std::fmt;
use std::time::Duration;

use rand::Rng;

/// Upper bound of the reconnection count used for backoff.
const MAX_BACKOFF_STEP: i32 = 6;

/// Upper bound of the random delay after the first failure.
const FIRST_FAILURE_JITTER: Duration = Duration::from_secs(5);

/// Relative jitter applied to the backoff after repeated failures.
const BACKOFF_JITTER: f64 = 0.1;

/// Health of the connection to the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    /// No request has been sent yet, or a grace period elapsed and the next send may be attempted.
    #[default]
    Started,
    /// The last request succeeded.
    Healthy,
    /// The backend is unreachable or failed. Sends are refused until the grace period elapsed.
    Failing,
    /// The backend asked to slow down.
    RateLimited,
    /// The backend rejected the last request.
    ClientFailing,
}

impl TransportStatus {
    /// Returns the name of the status for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Healthy => "healthy",
            Self::Failing => "failing",
            Self::RateLimited => "rate_limited",
            Self::ClientFailing => "client_failing",
        }
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the minimum wait after a failed send.
///
/// The first failure waits a random time below five seconds, so that many instances started at
/// the same time do not retry in lockstep. Every further failure waits `min(n, 6)²` seconds with
/// 10% jitter.
pub fn compute_grace_period(reconnection_count: i32) -> Duration {
    let mut rng = rand::rng();

    if reconnection_count <= 0 {
        let millis = rng.random_range(0..FIRST_FAILURE_JITTER.as_millis() as u64);
        return Duration::from_millis(millis);
    }

    let step = reconnection_count.min(MAX_BACKOFF_STEP) as f64;
    let base = step * step;
    let jitter = rng.random_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    Duration::from_secs_f64(base * (1.0 + jitter))
}
