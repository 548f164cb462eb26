//! Run-scoped cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Poll interval for async waiters (in-flight HTTP calls)
const ASYNC_POLL: Duration = Duration::from_millis(50);

/// Cancellation signal shared by every stage of one run.
///
/// Cloning is cheap; all clones observe the same flag. Blocking sleeps made
/// through [`CancelToken::sleep`] wake up as soon as the token is cancelled.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    flag: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation (signal handlers, fatal errors)
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap();
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `dur` unless cancelled first.
    ///
    /// Returns `false` if the sleep was cut short by cancellation.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let mut guard = self.inner.lock.lock().unwrap();
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            guard = self.inner.cond.wait_timeout(guard, deadline - now).unwrap().0;
        }
    }

    /// Resolves once the token is cancelled. Used to abort in-flight requests.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(ASYNC_POLL).await;
        }
    }
}
