//! Streaming variant: units produce values, delivered in completion order.
//!
//! Completed values land in an unbounded channel that the admission loop
//! empties before pulling each new input. Once the input is exhausted the
//! loop waits on the channel itself; it closes when the last unit drops its
//! sender, so no value waits on a polling interval.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use async_stream::try_stream;
use futures::stream::{self as futures_stream, Stream, StreamExt};
use tokio::sync::mpsc;

use super::{ThrottledRunner, blocking_unit};
use crate::error::TaskError;
use crate::queue::ThrottledQueue;

impl ThrottledRunner {
    /// Run every unit and yield each value as soon as its unit completes.
    ///
    /// The returned stream is single-pass and tied to this one run. It yields
    /// at most one `Err`, the first observed failure, and ends after it.
    /// Dropping the stream early stops admission; units already admitted run
    /// to completion unobserved.
    pub fn stream_results<I, Fut, T, E>(
        &self,
        units: I,
    ) -> impl Stream<Item = Result<T, TaskError<E>>> + use<I, Fut, T, E>
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.stream_results_from(futures_stream::iter(units))
    }

    /// [`stream_results`](Self::stream_results) for an asynchronously
    /// produced sequence.
    pub fn stream_results_from<S, Fut, T, E>(
        &self,
        units: S,
    ) -> impl Stream<Item = Result<T, TaskError<E>>> + use<S, Fut, T, E>
    where
        S: Stream<Item = Fut>,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.stream_units(units.map(|unit| async move { unit.await.map_err(TaskError::Failed) }))
    }

    /// Apply `transform` to every item, yielding outputs in completion order.
    pub fn map<I, A, Fut, T, E>(
        &self,
        items: I,
        transform: A,
    ) -> impl Stream<Item = Result<T, TaskError<E>>> + use<I, A, Fut, T, E>
    where
        I: IntoIterator,
        A: FnMut(I::Item) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.stream_results(items.into_iter().map(transform))
    }

    pub fn map_from<S, A, Fut, T, E>(
        &self,
        items: S,
        transform: A,
    ) -> impl Stream<Item = Result<T, TaskError<E>>> + use<S, A, Fut, T, E>
    where
        S: Stream,
        A: FnMut(S::Item) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.stream_results_from(items.map(transform))
    }

    /// Apply a synchronous `transform` to every item on the blocking pool.
    pub fn map_blocking<I, A, T, E>(
        &self,
        items: I,
        transform: A,
    ) -> impl Stream<Item = Result<T, TaskError<E>>> + use<I, A, T, E>
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        A: Fn(I::Item) -> Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let transform = Arc::new(transform);
        self.stream_units(futures_stream::iter(items).map(move |item| {
            let transform = Arc::clone(&transform);
            blocking_unit(move || transform(item))
        }))
    }

    fn stream_units<S, Fut, T, E>(
        &self,
        units: S,
    ) -> impl Stream<Item = Result<T, TaskError<E>>> + use<S, Fut, T, E>
    where
        S: Stream<Item = Fut>,
        Fut: Future<Output = Result<T, TaskError<E>>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let limit = self.max_concurrent;

        try_stream! {
            let queue = ThrottledQueue::with_limit(limit);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut units = pin!(units);

            loop {
                while let Ok(value) = rx.try_recv() {
                    yield value;
                }
                match units.next().await {
                    Some(unit) => queue.admit(deliver(unit, tx.clone())).await?,
                    None => break,
                }
            }

            // Every unit holds a sender; the channel closes when the last one finishes.
            drop(tx);
            while let Some(value) = rx.recv().await {
                yield value;
            }
            queue.drain().await?;
            tracing::debug!(admitted = queue.admitted(), "Result stream completed");
        }
    }
}

/// Wrap `unit` so its value is pushed to `tx` on success.
async fn deliver<Fut, T, E>(unit: Fut, tx: mpsc::UnboundedSender<T>) -> Result<(), TaskError<E>>
where
    Fut: Future<Output = Result<T, TaskError<E>>>,
{
    let value = unit.await?;
    // Closed only if the consumer dropped the stream.
    let _ = tx.send(value);
    Ok(())
}
