//! Wall-clock budget and interruption for collaborator calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Cloneable abort flag. Triggering it stops the run at the next
/// collaborator call, or cancels the call in flight.
#[derive(Debug, Clone)]
pub struct InterruptSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for InterruptSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has been triggered.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Why a guarded call did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallStop {
    /// The run's wall-clock budget is spent.
    Deadline,
    /// The per-call cap elapsed with run budget left.
    CallTimeout(Duration),
    Interrupted,
}

/// Run deadline plus the optional per-call cap.
#[derive(Debug, Clone)]
pub(crate) struct Budget {
    started: Instant,
    timeout: Duration,
    call_timeout: Option<Duration>,
}

impl Budget {
    pub fn start(timeout: Duration, call_timeout: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            timeout,
            call_timeout,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.elapsed() >= self.timeout
    }

    /// Check interruption and the deadline without calling anything.
    pub fn checkpoint(&self, interrupt: &InterruptSignal) -> Result<(), CallStop> {
        if interrupt.is_triggered() {
            return Err(CallStop::Interrupted);
        }
        if self.expired() {
            return Err(CallStop::Deadline);
        }
        Ok(())
    }

    /// Race `call` against the remaining budget and the interrupt signal,
    /// checking both before and after.
    pub async fn guard<F>(&self, interrupt: &InterruptSignal, call: F) -> Result<F::Output, CallStop>
    where
        F: Future,
    {
        self.checkpoint(interrupt)?;

        let remaining = self.remaining();
        let limit = match self.call_timeout {
            Some(cap) if cap < remaining => cap,
            _ => remaining,
        };

        let value = tokio::select! {
            biased;
            _ = interrupt.triggered() => return Err(CallStop::Interrupted),
            result = tokio::time::timeout(limit, call) => match result {
                Ok(value) => value,
                Err(_) if self.expired() => return Err(CallStop::Deadline),
                Err(_) => return Err(CallStop::CallTimeout(limit)),
            },
        };

        self.checkpoint(interrupt)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_passes_value_through() {
        let budget = Budget::start(Duration::from_secs(5), None);
        let value = budget.guard(&InterruptSignal::new(), async { 7 }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_times_out_at_deadline() {
        let budget = Budget::start(Duration::from_secs(1), None);
        let slow = tokio::time::sleep(Duration::from_secs(10));
        let result = budget.guard(&InterruptSignal::new(), slow).await;
        assert_eq!(result, Err(CallStop::Deadline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_cap_is_not_the_deadline() {
        let budget = Budget::start(Duration::from_secs(60), Some(Duration::from_secs(2)));
        let slow = tokio::time::sleep(Duration::from_secs(10));
        let result = budget.guard(&InterruptSignal::new(), slow).await;
        assert_eq!(result, Err(CallStop::CallTimeout(Duration::from_secs(2))));
    }

    #[tokio::test]
    async fn test_interrupt_cancels_call() {
        let budget = Budget::start(Duration::from_secs(60), None);
        let interrupt = InterruptSignal::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });
        let result = budget
            .guard(&interrupt, tokio::time::sleep(Duration::from_secs(30)))
            .await;
        assert_eq!(result, Err(CallStop::Interrupted));
    }

    #[tokio::test]
    async fn test_triggered_before_call() {
        let budget = Budget::start(Duration::from_secs(60), None);
        let interrupt = InterruptSignal::new();
        interrupt.trigger();
        assert!(interrupt.is_triggered());
        assert_eq!(budget.guard(&interrupt, async {}).await, Err(CallStop::Interrupted));
    }
}
