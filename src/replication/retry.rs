//! Retry policies for coordinator and fetch operations.
//!
//! The background loops retry by their own fixed sleeps: a loop iteration
//! that fails simply runs again next tick. These policies cover the places
//! where waiting a tick is the wrong answer: the write hook, where a caller
//! is blocked on the commit, and the part download inside a queue worker,
//! where giving up sends the whole entry back to the tail.
//!
//! All policies include jitter to prevent thundering herd when many replicas
//! restart together.
//!
//! # Example
//!
//! ```rust,ignore
//! use backon::Retryable;
//! use replitree::replication::retry;
//!
//! let children = (|| async { coordinator.children(&path).await })
//!     .retry(retry::coordinator_policy())
//!     .await?;
//! ```

use std::time::Duration;

use backon::ExponentialBuilder;

/// Policy for coordinator operations on foreground paths.
///
/// Characteristics:
/// - Moderate initial delay (50ms) to ride out a leader change in the
///   ensemble
/// - Max delay 5s, up to 10 attempts
/// - Jitter
pub fn coordinator_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Policy for the part download inside a queue worker's fetch.
///
/// Characteristics:
/// - Longer initial delay (100ms): the peer may be mid-restart
/// - Max delay 10s, 5 attempts: after that the entry is re-queued anyway
/// - Jitter
pub fn fetch_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(5)
        .with_jitter()
}
