//! Bounded-concurrency admission queue.
//!
//! Admission is guarded by two gates:
//! - an admission semaphore with `max_concurrent` permits, taken before a unit
//!   starts and released by the unit's own task when it finishes
//! - a mutex over the running set, held only while grooming and inserting
//!
//! A failure halts admission once a later `enqueue` (or `drain`) observes it.

mod admission;
mod running;

pub use admission::ThrottledQueue;
