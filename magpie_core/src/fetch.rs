use crate::cancel::CancelToken;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors surfaced by a fetch. Transient remote-store failures are retried
/// inside the client and never reach the caller; the only way a fetch returns
/// early is cooperative cancellation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FetchError {
    /// The shutdown token tripped while waiting out a retry backoff.
    /// This is not a data error; the caller should stop its loop quietly.
    #[error("fetch aborted by shutdown")]
    Cancelled,
}

/// Exponential backoff schedule for transient remote-store failures.
///
/// The schedule is a pure function of the attempt number so retry behavior
/// can be tested without any network involvement. There is no maximum attempt
/// count: remote-store hiccups are assumed always eventually recoverable, and
/// only cancellation breaks the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2,
            max: Duration::from_secs(1024),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based): `initial * factor^attempt`,
    /// saturating, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut growth: u32 = 1;
        for _ in 0..attempt {
            growth = growth.saturating_mul(self.factor);
        }
        self.initial.saturating_mul(growth).min(self.max)
    }
}

/// Byte-range retrieval from the remote archive store.
///
/// `fetch` must return exactly the bytes `[offset, offset + length - 1]` of
/// the object named by `locator`, or `FetchError::Cancelled` if shutdown
/// became active before the bytes could be obtained.
pub trait FetchClient: Send + Sync {
    fn fetch(
        &self,
        locator: &str,
        offset: u64,
        length: u64,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, FetchError>;
}

/// HTTP range-GET client backed by a single connection-pooled [`ureq::Agent`]
/// shared across all worker threads.
pub struct HttpFetchClient {
    agent: ureq::Agent,
    base_url: String,
    policy: RetryPolicy,
}

impl HttpFetchClient {
    pub fn new(base_url: &str, request_timeout: Duration, policy: RetryPolicy) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(request_timeout).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            policy,
        }
    }

    fn attempt(&self, url: &str, offset: u64, length: u64) -> anyhow::Result<Vec<u8>> {
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let response = self.agent.get(url).set("Range", &range).call()?;
        let mut body = Vec::with_capacity(length as usize);
        response.into_reader().read_to_end(&mut body)?;
        Ok(body)
    }
}

impl FetchClient for HttpFetchClient {
    fn fetch(
        &self,
        locator: &str,
        offset: u64,
        length: u64,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}/{}", self.base_url, locator.trim_start_matches('/'));
        let mut attempt: u32 = 0;
        loop {
            match self.attempt(&url, offset, length) {
                Ok(body) => return Ok(body),
                Err(e) => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        locator,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "transient fetch failure, backing off"
                    );
                    if !cancel.sleep(delay) {
                        return Err(FetchError::Cancelled);
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_1024_units() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..12).map(|a| policy.delay(a).as_secs()).collect();
        assert_eq!(
            delays,
            vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 1024]
        );
    }

    #[test]
    fn backoff_never_exceeds_cap_for_large_attempts() {
        let policy = RetryPolicy::default();
        for attempt in [12, 20, 31, 64, u32::MAX] {
            assert_eq!(policy.delay(attempt), Duration::from_secs(1024));
        }
    }

    #[test]
    fn backoff_respects_custom_schedule() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(100),
            factor: 3,
            max: Duration::from_secs(2),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(300));
        assert_eq!(policy.delay(2), Duration::from_millis(900));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
    }

    #[test]
    fn cancelled_token_aborts_retry_loop() {
        // A client whose every attempt fails: port 1 refuses connections
        // immediately, so no real network traffic happens.
        let client = HttpFetchClient::new(
            "http://127.0.0.1:1",
            Duration::from_millis(200),
            RetryPolicy {
                initial: Duration::from_millis(10),
                factor: 2,
                max: Duration::from_millis(40),
            },
        );
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            canceller.cancel();
        });
        let result = client.fetch("crawl-data/segment/file.warc.gz", 0, 16, &cancel);
        assert_eq!(result, Err(FetchError::Cancelled));
        handle.join().unwrap();
    }
}
