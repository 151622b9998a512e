use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity at which blocking primitives poll for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative cancellation token shared by every blocking path in a run.
///
/// Workers never get terminated forcibly; instead each blocking primitive
/// (retry backoff, process wait, the worker loop itself) takes a token and
/// checks it at poll granularity. Cloning is cheap and all clones observe
/// the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the token. Irreversible for the lifetime of the run.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early if the token trips.
    ///
    /// Returns `true` if the full duration elapsed, `false` if the sleep was
    /// interrupted by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}
