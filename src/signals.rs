use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

/// The two signal classes the loop recognizes: a graceful stop (finish the
/// current database operation, then exit) and a configuration reload
/// (applied at the top of the next tick).
///
/// Handles are cheap clones sharing the same flags, so a signal-handler
/// task and the loop can hold their own copies.
#[derive(Clone)]
pub struct Signals {
    stop: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl Signals {
    pub fn new() -> Self {
        Signals {
            stop: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    /// Consume a pending reload request, so one signal triggers one reload.
    pub fn take_reload_request(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early when a stop is requested. Returns
    /// true when the sleep was cut short by a stop, so polling loops can
    /// check this instead of re-reading the flag.
    pub async fn interruptible_sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(100);

        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.stop_requested() {
                return true;
            }
            let nap = remaining.min(SLICE);
            tokio::time::sleep(nap).await;
            remaining = remaining.saturating_sub(nap);
        }

        self.stop_requested()
    }
}

impl Default for Signals {
    fn default() -> Self {
        Signals::new()
    }
}
