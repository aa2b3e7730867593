use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Counted barrier over in-flight message handlers
///
/// Handlers hold an [`InFlightGuard`] while they deliver. Once [`close`]
/// is called no new guard is handed out, and [`wait_idle`] resolves when the
/// last outstanding guard is dropped.
///
/// [`close`]: InFlight::close
/// [`wait_idle`]: InFlight::wait_idle
#[derive(Debug)]
pub struct InFlight {
    count: watch::Sender<usize>,
    closed: AtomicBool,
}

/// Proof of an admitted handler invocation; released on drop
#[derive(Debug)]
pub struct InFlightGuard {
    barrier: Arc<InFlight>,
}

impl InFlight {
    /// New, open barrier
    pub fn new() -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self {
            count,
            closed: AtomicBool::new(false),
        })
    }

    /// Admit a handler invocation, unless the barrier is closed
    pub fn enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        // The closed check and the increment happen under the watch lock, so
        // they cannot interleave with `close`.
        let admitted = self.count.send_if_modified(|count| {
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            *count += 1;
            true
        });
        admitted.then(|| InFlightGuard {
            barrier: Arc::clone(self),
        })
    }

    /// Refuse further invocations
    pub fn close(&self) {
        self.count.send_modify(|_| self.closed.store(true, Ordering::Release));
    }

    /// Whether [`InFlight::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of invocations currently admitted
    pub fn active(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no invocation is in flight
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.barrier.count.send_modify(|count| *count -= 1);
    }
}
