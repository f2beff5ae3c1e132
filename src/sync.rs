// src/sync.rs - Interruptible wait and completion counter primitives
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

/// Why a waiter woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    TimedOut,
    Interrupted,
}

/// A blocking primitive that sleeps until an absolute deadline or an
/// external interrupt, whichever comes first.
///
/// Interrupts are broadcast to every current waiter and carry no
/// payload. Wakeups may be spurious from the caller's point of view:
/// anything waiting on a condition must re-check it after waking.
#[derive(Debug, Default)]
pub struct InterruptibleWait {
    notify: Notify,
}

impl InterruptibleWait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes every task currently blocked in `wait_until`/`wait_for`.
    pub fn interrupt(&self) {
        self.notify.notify_waiters();
    }

    pub async fn wait_until(&self, deadline: Instant) -> WaitOutcome {
        tokio::select! {
            _ = self.notify.notified() => WaitOutcome::Interrupted,
            _ = tokio::time::sleep_until(deadline) => WaitOutcome::TimedOut,
        }
    }

    pub async fn wait_for(&self, duration: Duration) -> WaitOutcome {
        self.wait_until(Instant::now() + duration).await
    }
}

/// Shared counter with blocking wait-for-value, used to drain worker
/// tasks during shutdown. Purely a synchronization primitive; it never
/// errors.
#[derive(Debug, Default)]
pub struct CompletionCounter {
    count: AtomicI64,
    notify: Notify,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn decrement(&self) {
        self.add(-1);
    }

    fn add(&self, delta: i64) {
        self.count.fetch_add(delta, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn value(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Blocks until the counter equals `target`.
    pub async fn wait_for(&self, target: i64) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the check so a change between the check
            // and the await is not lost.
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == target {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_at_deadline() {
        let wait = InterruptibleWait::new();
        let outcome = wait.wait_for(Duration::from_millis(50)).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn interrupt_wakes_waiter() {
        let wait = Arc::new(InterruptibleWait::new());
        let waiter = {
            let wait = wait.clone();
            tokio::spawn(async move { wait.wait_for(Duration::from_secs(60)).await })
        };
        // Let the waiter task register before interrupting.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        wait.interrupt();
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome, WaitOutcome::Interrupted);
    }

    #[tokio::test]
    async fn counter_wait_for_target() {
        let counter = Arc::new(CompletionCounter::new());
        counter.increment();
        counter.increment();
        assert_eq!(counter.value(), 2);

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait_for(0).await })
        };
        counter.decrement();
        counter.decrement();
        waiter.await.unwrap();
        assert_eq!(counter.value(), 0);
    }

    #[tokio::test]
    async fn counter_wait_returns_immediately_when_already_there() {
        let counter = CompletionCounter::new();
        counter.wait_for(0).await;
    }
}
