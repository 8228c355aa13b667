//! ThrottledQueue: admits work units one at a time, runs at most
//! `max_concurrent` of them at once, and halts on the first failure.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Semaphore};

use super::running::RunningSet;
use crate::config::gate_size;
use crate::error::{ConfigError, TaskError};

/// Admission engine for a single logical producer.
///
/// [`enqueue`](Self::enqueue) returns as soon as the unit is scheduled. The
/// call after the concurrency limit is reached waits until a running unit
/// finishes. A failed unit is reported by the next `enqueue` or `drain` that
/// observes it; units admitted before that keep running.
pub struct ThrottledQueue<E: 'static> {
    admission: Arc<Semaphore>,
    running: Mutex<RunningSet<E>>,
    max_concurrent: usize,
    admitted: AtomicUsize,
    halted: AtomicBool,
}

impl<E: Send + 'static> ThrottledQueue<E> {
    pub fn new(max_concurrent: usize) -> Result<Self, ConfigError> {
        let limit = gate_size(max_concurrent, ConfigError::ZeroConcurrency)?;
        Ok(Self::with_limit(limit))
    }

    pub(crate) fn with_limit(limit: NonZeroUsize) -> Self {
        let max_concurrent = limit.get();
        tracing::debug!(max_concurrent, "Creating throttled queue");

        Self {
            admission: Arc::new(Semaphore::new(max_concurrent)),
            running: Mutex::new(RunningSet::new()),
            max_concurrent,
            admitted: AtomicUsize::new(0),
            halted: AtomicBool::new(false),
        }
    }

    /// Admit `unit`, waiting for a free slot first.
    ///
    /// Fails with the first observed unit failure, after waiting for every
    /// unit still running. Once that has happened the queue is halted and
    /// further calls fail with [`TaskError::Halted`].
    pub async fn enqueue<F>(&self, unit: F) -> Result<(), TaskError<E>>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.admit(async move { unit.await.map_err(TaskError::Failed) })
            .await
    }

    pub(crate) async fn admit<F>(&self, unit: F) -> Result<(), TaskError<E>>
    where
        F: Future<Output = Result<(), TaskError<E>>> + Send + 'static,
    {
        if self.is_halted() {
            return Err(TaskError::Halted);
        }

        let permit = Arc::clone(&self.admission)
            .acquire_owned()
            .await
            .map_err(|_| TaskError::Closed)?;

        let mut running = self.running.lock().await;
        if self.is_halted() {
            return Err(TaskError::Halted);
        }

        if let Some(first) = running.groom() {
            self.halted.store(true, Ordering::Release);
            let pending = std::mem::take(&mut *running);
            drop(running);
            drop(permit);
            return Err(self.halt(first, pending).await);
        }

        running.spawn(unit, permit);
        let admitted = self.admitted.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(admitted, tracked = running.len(), "Admitted work unit");
        Ok(())
    }

    /// Wait for every admitted unit to finish.
    ///
    /// Fails with the first failure observed, in completion order.
    pub async fn drain(&self) -> Result<(), TaskError<E>> {
        if self.is_halted() {
            return Err(TaskError::Halted);
        }

        // Joined outside the lock so a unit's runtime never holds the gate.
        let mut pending = std::mem::take(&mut *self.running.lock().await);
        match pending.join_all().await {
            None => {
                tracing::debug!(admitted = self.admitted(), "Queue drained");
                Ok(())
            }
            Some(first) => {
                self.halted.store(true, Ordering::Release);
                Err(self.halt(first, pending).await)
            }
        }
    }

    /// Wait out the units still running and hand back the first failure.
    async fn halt(&self, first: TaskError<E>, mut pending: RunningSet<E>) -> TaskError<E> {
        tracing::warn!(
            kind = first.kind(),
            admitted = self.admitted(),
            "Work unit failed, halting admission"
        );
        if let Some(later) = pending.join_all().await {
            tracing::debug!(kind = later.kind(), "Discarding failure after the first");
        }
        first
    }

    /// Stop admitting. Waiting and future `enqueue` calls fail with
    /// [`TaskError::Closed`]; running units are unaffected. Safe to call
    /// more than once.
    pub fn close(&self) {
        if self.admission.is_closed() {
            return;
        }
        tracing::debug!(admitted = self.admitted(), "Closing throttled queue");
        self.admission.close();
    }

    pub fn is_closed(&self) -> bool {
        self.admission.is_closed()
    }

    /// True once a failure has been reported.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Units currently holding an admission permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.admission.available_permits())
    }

    /// Units admitted since creation.
    pub fn admitted(&self) -> usize {
        self.admitted.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.running.lock().await.len()
    }
}

impl<E: 'static> std::fmt::Debug for ThrottledQueue<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottledQueue")
            .field("max_concurrent", &self.max_concurrent)
            .field("admitted", &self.admitted.load(Ordering::Relaxed))
            .field("halted", &self.halted.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn explode() -> Result<(), String> {
        panic!("unit blew up")
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = ThrottledQueue::<()>::new(0).unwrap_err();
        assert_eq!(err, ConfigError::ZeroConcurrency);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn thousand_units_all_run() {
        let queue = ThrottledQueue::<()>::new(5).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            queue
                .enqueue(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        queue.drain().await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        assert_eq!(queue.admitted(), 1000);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn failing_unit_halts_admission() {
        let queue = ThrottledQueue::new(5).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut outcome = Ok(());

        for i in 0..1000usize {
            let counter = Arc::clone(&counter);
            let result = queue
                .enqueue(async move {
                    if i == 500 {
                        return Err(i);
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            if let Err(err) = result {
                outcome = Err(err);
                break;
            }
        }
        let err = match outcome {
            Err(err) => err,
            Ok(()) => queue.drain().await.unwrap_err(),
        };

        assert!(matches!(err, TaskError::Failed(500)));
        assert!(counter.load(Ordering::SeqCst) < 1000);
        assert!(queue.is_halted());

        let after = queue.enqueue(async { Ok(()) }).await;
        assert!(matches!(after, Err(TaskError::Halted)));
        assert!(matches!(queue.drain().await, Err(TaskError::Halted)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_limit() {
        let queue = ThrottledQueue::<()>::new(3).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..200 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            queue
                .enqueue(async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
            assert!(queue.in_flight() <= 3);
        }
        queue.drain().await.unwrap();

        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak concurrency {peak}");
    }

    #[tokio::test]
    async fn enqueue_returns_before_unit_completes() {
        let queue = ThrottledQueue::<()>::new(2).unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        queue
            .enqueue(async move {
                let _ = rx.await;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(queue.in_flight(), 1);

        tx.send(()).unwrap();
        queue.drain().await.unwrap();
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_waits_at_capacity() {
        let queue = ThrottledQueue::<()>::new(1).unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        queue
            .enqueue(async move {
                let _ = rx.await;
                Ok(())
            })
            .await
            .unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), queue.enqueue(async { Ok(()) })).await;
        assert!(blocked.is_err());
        assert_eq!(queue.admitted(), 1);

        tx.send(()).unwrap();
        queue.enqueue(async { Ok(()) }).await.unwrap();
        queue.drain().await.unwrap();
        assert_eq!(queue.admitted(), 2);
    }

    #[tokio::test]
    async fn grooming_bounds_bookkeeping() {
        let queue = ThrottledQueue::<()>::new(4).unwrap();

        for _ in 0..10_000 {
            queue.enqueue(async { Ok(()) }).await.unwrap();
            assert!(queue.tracked().await <= 4);
        }
        queue.drain().await.unwrap();
        assert_eq!(queue.tracked().await, 0);
    }

    #[tokio::test]
    async fn panicking_unit_surfaces_panic() {
        let queue = ThrottledQueue::new(2).unwrap();
        queue.enqueue(async { explode() }).await.unwrap();

        let err = queue.drain().await.unwrap_err();
        assert!(matches!(err, TaskError::Panicked(ref msg) if msg == "unit blew up"));
    }

    #[tokio::test]
    async fn drain_reports_failure() {
        let queue = ThrottledQueue::new(3).unwrap();
        queue.enqueue(async { Ok(()) }).await.unwrap();
        queue
            .enqueue(async { Err("last unit failed".to_string()) })
            .await
            .unwrap();

        let err = queue.drain().await.unwrap_err();
        assert_eq!(err.into_failure().as_deref(), Some("last unit failed"));
    }

    #[tokio::test]
    async fn close_rejects_enqueue() {
        let queue = ThrottledQueue::<()>::new(2).unwrap();
        queue.close();
        queue.close();

        assert!(queue.is_closed());
        let result = queue.enqueue(async { Ok(()) }).await;
        assert!(matches!(result, Err(TaskError::Closed)));
        assert!(!queue.is_halted());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_queue_lets_units_finish() {
        let finished = Arc::new(AtomicBool::new(false));
        {
            let queue = ThrottledQueue::<()>::new(1).unwrap();
            let finished = Arc::clone(&finished);
            queue
                .enqueue(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
