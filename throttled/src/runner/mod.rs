//! ThrottledRunner: drives a [`ThrottledQueue`] from a producer.
//!
//! A producer is either an iterator (materialised or lazy, possibly endless)
//! or a [`Stream`] of items produced asynchronously. Items are pulled one at a
//! time, only when the runner is about to admit them, so the input is never
//! buffered. After a failure nothing more is pulled.
//!
//! Work units are plain futures: building one does no work, the queue starts
//! it on admission.

mod stream;

use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::pin;
use std::sync::Arc;

use futures::stream::{self as futures_stream, Stream, StreamExt};

use crate::config::gate_size;
use crate::error::{ConfigError, TaskError};
use crate::queue::ThrottledQueue;

/// Runs producers through a fresh [`ThrottledQueue`] per call.
#[derive(Debug, Clone, Copy)]
pub struct ThrottledRunner {
    max_concurrent: NonZeroUsize,
}

impl ThrottledRunner {
    pub fn new(max_concurrent: usize) -> Result<Self, ConfigError> {
        let max_concurrent = gate_size(max_concurrent, ConfigError::ZeroConcurrency)?;
        Ok(Self { max_concurrent })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.get()
    }

    /// Run every unit from `units`, at most `max_concurrent` at a time.
    ///
    /// Fails with the first observed unit failure; the rest of `units` is
    /// left unconsumed.
    pub async fn run_all<I, Fut, E>(&self, units: I) -> Result<(), TaskError<E>>
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        self.run_all_from(futures_stream::iter(units)).await
    }

    /// [`run_all`](Self::run_all) for an asynchronously produced sequence.
    pub async fn run_all_from<S, Fut, E>(&self, units: S) -> Result<(), TaskError<E>>
    where
        S: Stream<Item = Fut>,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        self.drive(units.map(|unit| async move { unit.await.map_err(TaskError::Failed) }))
            .await
    }

    /// Apply `action` to every item. `action` is called in the admission loop
    /// to build each unit; the returned future runs under the limit.
    pub async fn for_each<I, A, Fut, E>(&self, items: I, action: A) -> Result<(), TaskError<E>>
    where
        I: IntoIterator,
        A: FnMut(I::Item) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        self.run_all(items.into_iter().map(action)).await
    }

    pub async fn for_each_from<S, A, Fut, E>(&self, items: S, action: A) -> Result<(), TaskError<E>>
    where
        S: Stream,
        A: FnMut(S::Item) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        self.run_all_from(items.map(action)).await
    }

    /// Apply a synchronous `action` to every item on the blocking pool.
    pub async fn for_each_blocking<I, A, E>(&self, items: I, action: A) -> Result<(), TaskError<E>>
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        A: Fn(I::Item) -> Result<(), E> + Send + Sync + 'static,
        E: Send + 'static,
    {
        let action = Arc::new(action);
        self.drive(futures_stream::iter(items).map(move |item| {
            let action = Arc::clone(&action);
            blocking_unit(move || action(item))
        }))
        .await
    }

    async fn drive<S, Fut, E>(&self, units: S) -> Result<(), TaskError<E>>
    where
        S: Stream<Item = Fut>,
        Fut: Future<Output = Result<(), TaskError<E>>> + Send + 'static,
        E: Send + 'static,
    {
        let queue = ThrottledQueue::with_limit(self.max_concurrent);
        let mut units = pin!(units);

        while let Some(unit) = units.next().await {
            queue.admit(unit).await?;
        }
        queue.drain().await?;

        tracing::debug!(admitted = queue.admitted(), "Run completed");
        Ok(())
    }
}

/// Run `f` on the blocking pool, mapping its panic or cancellation.
pub(crate) async fn blocking_unit<F, T, E>(f: F) -> Result<T, TaskError<E>>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(TaskError::Failed),
        Err(join_err) => Err(join_err.into()),
    }
}
