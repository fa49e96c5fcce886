use std::sync::Arc;

use tokio::sync::watch;

/// A resettable one-shot signal.
///
/// The latch starts open. [`signal`](Self::signal) closes it and wakes every waiter, repeated
/// signals are no-ops until [`reset`](Self::reset) opens it again. Clones share the same state.
#[derive(Clone, Debug)]
pub struct Latch {
    state: Arc<watch::Sender<bool>>,
}

impl Latch {
    /// Creates a new, unsignaled latch.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Raises the signal.
    ///
    /// Returns `true` if this call raised it, and `false` if it was already pending.
    pub fn signal(&self) -> bool {
        self.state.send_if_modified(|signaled| {
            if *signaled {
                false
            } else {
                *signaled = true;
                true
            }
        })
    }

    /// Returns `true` if the signal is pending.
    pub fn is_signaled(&self) -> bool {
        *self.state.borrow()
    }

    /// Waits until the signal is raised. Returns immediately if it is already pending.
    pub async fn wait(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        receiver.wait_for(|signaled| *signaled).await.ok();
    }

    /// Clears a pending signal so the latch can be used for the next invocation.
    pub fn reset(&self) {
        self.state.send_replace(false);
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn wait_timeout(latch: &Latch, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, latch.wait()).await.is_ok()
    }

    #[tokio::test]
    async fn test_signal_is_idempotent() {
        let latch = Latch::new();
        assert!(!latch.is_signaled());

        assert!(latch.signal());
        assert!(!latch.signal());
        assert!(latch.is_signaled());

        // A pending signal resolves immediately.
        latch.wait().await;
    }

    #[tokio::test]
    async fn test_signal_wakes_waiter() {
        let latch = Latch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };

        tokio::task::yield_now().await;
        latch.signal();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_elapses() {
        let latch = Latch::new();
        assert!(!wait_timeout(&latch, Duration::from_millis(100)).await);

        latch.signal();
        assert!(wait_timeout(&latch, Duration::from_millis(100)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_does_not_leak_into_next_round() {
        let latch = Latch::new();
        latch.signal();
        latch.reset();

        assert!(!latch.is_signaled());
        assert!(!wait_timeout(&latch, Duration::from_millis(10)).await);
        assert!(latch.signal());
    }
}
