//! Tracer trait for observing fetch orchestration.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! how fetch requests are started, deduplicated, replaced and settled. The
//! default [`NoopTracer`] costs nothing when tracing is not needed.
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{QueryClient, QueryKey, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_fetch_start(&self, key: &QueryKey, invocation: u64) {
//!         println!("fetch {} started for {:?}", invocation, key);
//!     }
//! }
//!
//! let client = QueryClient::builder().tracer(PrintTracer).build();
//! ```

use crate::key::QueryKey;
use crate::signal::AbortReason;

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The work function returned data.
    Success,
    /// The work function observed its abort signal.
    Aborted,
    /// The work function failed.
    Error {
        /// Display representation of the error.
        message: String,
    },
}

/// Tracer trait for observing the fetch engine.
///
/// All methods have default empty implementations, so you only need to override
/// the events you're interested in.
///
/// # Thread Safety
///
/// Events are emitted from whichever task settles an attempt, so implementations
/// must be `Send + Sync`.
pub trait Tracer: Send + Sync + 'static {
    /// Called when a client creates a query for a new key.
    #[inline]
    fn on_query_created(&self, _key: &QueryKey) {}

    /// Called when a client removes a query.
    #[inline]
    fn on_query_removed(&self, _key: &QueryKey) {}

    /// Called when a new invocation of the work function is started.
    #[inline]
    fn on_fetch_start(&self, _key: &QueryKey, _invocation: u64) {}

    /// Called when a fetch request joins the in-flight invocation.
    #[inline]
    fn on_fetch_deduplicated(&self, _key: &QueryKey, _invocation: u64) {}

    /// Called when an in-flight invocation is aborted in favour of a new one.
    #[inline]
    fn on_fetch_superseded(&self, _key: &QueryKey, _superseded: u64, _replacement: u64) {}

    /// Called when an invocation waits for connectivity before running.
    #[inline]
    fn on_fetch_paused(&self, _key: &QueryKey, _invocation: u64) {}

    /// Called when the current invocation settles and its outcome is published.
    #[inline]
    fn on_fetch_settled(&self, _key: &QueryKey, _invocation: u64, _outcome: &FetchOutcome) {}

    /// Called when a superseded or cancelled invocation finishes and its outcome is dropped.
    #[inline]
    fn on_fetch_discarded(&self, _key: &QueryKey, _invocation: u64) {}

    /// Called when an invocation is cancelled without a replacement.
    #[inline]
    fn on_fetch_cancelled(&self, _key: &QueryKey, _invocation: u64, _reason: &AbortReason) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`QueryClient`](crate::QueryClient) and
/// standalone queries.
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Tracer that forwards events to the `tracing` crate.
#[cfg(feature = "tracing")]
pub struct TracingTracer;

#[cfg(feature = "tracing")]
impl Tracer for TracingTracer {
    fn on_query_created(&self, key: &QueryKey) {
        tracing::trace!(key = %key, "query created");
    }

    fn on_query_removed(&self, key: &QueryKey) {
        tracing::trace!(key = %key, "query removed");
    }

    fn on_fetch_start(&self, key: &QueryKey, invocation: u64) {
        tracing::debug!(key = %key, invocation, "fetch started");
    }

    fn on_fetch_deduplicated(&self, key: &QueryKey, invocation: u64) {
        tracing::trace!(key = %key, invocation, "fetch deduplicated");
    }

    fn on_fetch_superseded(&self, key: &QueryKey, superseded: u64, replacement: u64) {
        tracing::debug!(key = %key, superseded, replacement, "fetch superseded");
    }

    fn on_fetch_paused(&self, key: &QueryKey, invocation: u64) {
        tracing::debug!(key = %key, invocation, "fetch paused while offline");
    }

    fn on_fetch_settled(&self, key: &QueryKey, invocation: u64, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Error { message } => {
                tracing::debug!(key = %key, invocation, error = %message, "fetch failed")
            }
            other => tracing::debug!(key = %key, invocation, outcome = ?other, "fetch settled"),
        }
    }

    fn on_fetch_discarded(&self, key: &QueryKey, invocation: u64) {
        tracing::trace!(key = %key, invocation, "stale fetch result discarded");
    }

    fn on_fetch_cancelled(&self, key: &QueryKey, invocation: u64, reason: &AbortReason) {
        tracing::debug!(key = %key, invocation, reason = %reason, "fetch cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTracer {
        start_count: AtomicUsize,
        settled_count: AtomicUsize,
    }

    impl CountingTracer {
        fn new() -> Self {
            Self {
                start_count: AtomicUsize::new(0),
                settled_count: AtomicUsize::new(0),
            }
        }
    }

    impl Tracer for CountingTracer {
        fn on_fetch_start(&self, _key: &QueryKey, _invocation: u64) {
            self.start_count.fetch_add(1, Ordering::Relaxed);
        }

        fn on_fetch_settled(&self, _key: &QueryKey, _invocation: u64, _outcome: &FetchOutcome) {
            self.settled_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_counting_tracer() {
        let tracer = CountingTracer::new();
        let key = crate::query_key!["test"];

        tracer.on_fetch_start(&key, 1);
        tracer.on_fetch_start(&key, 2);
        tracer.on_fetch_settled(&key, 2, &FetchOutcome::Success);
        tracer.on_fetch_discarded(&key, 1);

        assert_eq!(tracer.start_count.load(Ordering::Relaxed), 2);
        assert_eq!(tracer.settled_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tracer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopTracer>();
        assert_send_sync::<Arc<CountingTracer>>();
    }
}
