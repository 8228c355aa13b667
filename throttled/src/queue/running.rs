//! Bookkeeping for admitted work units.
//!
//! Finished entries are removed lazily, on each admission, so an unbounded
//! producer does not grow the set even though the admission gate already
//! bounds how many entries can be running.

use std::future::Future;

use tokio::sync::OwnedSemaphorePermit;
use tokio::task::{JoinError, JoinSet};

use crate::error::TaskError;

type Outcome<E> = Result<Result<(), TaskError<E>>, JoinError>;

pub(crate) struct RunningSet<E: 'static> {
    tasks: JoinSet<Result<(), TaskError<E>>>,
}

impl<E: Send + 'static> RunningSet<E> {
    pub(crate) fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
        }
    }

    /// Start `unit` on the runtime. `permit` is released when the unit
    /// finishes, whether it succeeds, fails or panics.
    pub(crate) fn spawn<F>(&mut self, unit: F, permit: OwnedSemaphorePermit)
    where
        F: Future<Output = Result<(), TaskError<E>>> + Send + 'static,
    {
        self.tasks.spawn(async move {
            let _permit = permit;
            unit.await
        });
    }

    /// Remove every finished entry without waiting.
    ///
    /// Returns the first failure among the removed entries; later ones are
    /// dropped.
    pub(crate) fn groom(&mut self) -> Option<TaskError<E>> {
        let mut first = None;
        while let Some(outcome) = self.tasks.try_join_next() {
            keep_first(&mut first, outcome);
        }
        first
    }

    /// Wait for every entry to finish, in completion order.
    ///
    /// Returns the first failure observed; later ones are dropped.
    pub(crate) async fn join_all(&mut self) -> Option<TaskError<E>> {
        let mut first = None;
        while let Some(outcome) = self.tasks.join_next().await {
            keep_first(&mut first, outcome);
        }
        first
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

impl<E: Send + 'static> Default for RunningSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> Drop for RunningSet<E> {
    fn drop(&mut self) {
        // Units already admitted run to completion even if nobody observes them.
        self.tasks.detach_all();
    }
}

fn keep_first<E>(first: &mut Option<TaskError<E>>, outcome: Outcome<E>) {
    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(join_err) => TaskError::from(join_err),
    };
    if first.is_none() {
        *first = Some(err);
    } else {
        tracing::debug!(kind = err.kind(), "Discarding failure after the first");
    }
}
