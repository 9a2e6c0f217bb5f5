use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use tokio::time::Instant;

/// Retries attempted per request by the platform clients.
pub const MAX_RETRIES: u32 = 3;

/// Enforces a minimum interval between requests to one API host.
///
/// Each client owns one gate, so the interval is per token, not global.
pub struct RateGate {
    min_interval: Duration,
    last_request: tokio::sync::Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: tokio::sync::Mutex::new(None),
        }
    }

    /// Sleeps until at least `min_interval` has passed since the previous
    /// call, then stamps the current instant.
    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Exponential back-off with a little jitter so parallel tenants do not
/// retry in lockstep.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let base = Duration::from_secs(1 << retry_count.min(5));
    let jitter = rand::thread_rng().gen_range(0..250);
    base + Duration::from_millis(jitter)
}

/// Reads `Retry-After` (seconds form) from a 429 response.
pub fn retry_after(headers: &HeaderMap, default_secs: u64) -> Duration {
    let secs = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
