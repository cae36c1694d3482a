//! Handles for live subscriptions.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

/// Cancellation point shared between a [`Subscription`] and its task.
///
/// Drivers deliver every callback through [`CallbackGate::deliver`]. The gate
/// lock is held for the whole callback, so once the subscription is cancelled
/// no callback is running and none will start.
#[derive(Debug, Clone, Default)]
pub struct CallbackGate {
    closed: Arc<Mutex<bool>>,
}

impl CallbackGate {
    /// Runs `callback` unless the gate is closed. Returns false once closed.
    pub fn deliver(&self, callback: impl FnOnce()) -> bool {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return false;
        }
        callback();
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Closes the gate, waiting for an in-flight callback to return.
    fn close(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

/// A running subscription.
///
/// Each subscription is a Tokio task feeding a callback. Calling
/// [`Subscription::unsubscribe`] or dropping the handle stops the task. After
/// either returns, the callback is never invoked again, on any runtime
/// flavor. Unsubscribing from inside the subscription's own callback
/// deadlocks.
#[derive(Debug)]
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    gate: CallbackGate,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Spawns the driver built by `driver` on the current Tokio runtime.
    ///
    /// The driver gets the subscription's [`CallbackGate`] and should stop
    /// once `deliver` returns false. Panics if called outside a runtime.
    pub fn spawn<D, F>(driver: D) -> Self
    where
        D: FnOnce(CallbackGate) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        let gate = CallbackGate::default();
        let task = tokio::spawn(driver(gate.clone()));
        Self {
            gate,
            task: Some(task),
        }
    }

    /// Stops the subscription.
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    /// True while the driving task hasn't finished or been cancelled.
    pub fn is_active(&self) -> bool {
        !self.gate.is_closed() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn cancel(&mut self) {
        self.gate.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_unsubscribe_stops_task() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = Subscription::spawn(|gate| async move {
            let mut n = 0;
            while gate.deliver(|| {
                let _ = tx.send(n);
            }) {
                n += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        assert_eq!(rx.recv().await, Some(0));
        assert!(subscription.is_active());
        subscription.unsubscribe();

        // The sender lived inside the task, so the channel closes once it's gone
        while rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_finished_task_is_inactive() {
        let subscription = Subscription::spawn(|_| async {});
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!subscription.is_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_callback_after_unsubscribe_on_worker_threads() {
        for _ in 0..100 {
            let stopped = Arc::new(AtomicBool::new(false));
            let late = Arc::new(AtomicUsize::new(0));
            let (started_tx, mut started_rx) = mpsc::unbounded_channel();

            let subscription = {
                let stopped = Arc::clone(&stopped);
                let late = Arc::clone(&late);
                Subscription::spawn(move |gate| async move {
                    // Busy driver: a callback is ready on every iteration
                    while gate.deliver(|| {
                        if stopped.load(Ordering::SeqCst) {
                            late.fetch_add(1, Ordering::SeqCst);
                        }
                        let _ = started_tx.send(());
                    }) {
                        tokio::task::yield_now().await;
                    }
                })
            };

            started_rx.recv().await.unwrap();
            subscription.unsubscribe();
            stopped.store(true, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(late.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_closed_gate_skips_callback() {
        let gate = CallbackGate::default();
        let mut calls = 0;
        assert!(gate.deliver(|| calls += 1));
        gate.close();
        assert!(!gate.deliver(|| calls += 1));
        assert_eq!(calls, 1);
        assert!(gate.is_closed());
    }
}
