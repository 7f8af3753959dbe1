//! Per-query and per-fetch configuration.

use std::time::Duration;

use crate::key::KeySegment;

/// Options fixed when a query is created.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryOptions {
    /// How long fetched data stays fresh. Zero means data is stale as soon as it lands.
    pub stale_time: Duration,
}

impl QueryOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how long fetched data stays fresh.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }
}

/// Options for a single [`Query::fetch`](crate::Query::fetch) call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// When an attempt is already in flight, abort it and start a new one
    /// (`true`), or join the running attempt (`false`). Defaults to `true`.
    pub cancel_refetch: bool,
    /// Request-scoped metadata handed to the work function, e.g. a page cursor.
    pub meta: Option<KeySegment>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cancel_refetch: true,
            meta: None,
        }
    }
}

impl FetchOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for options that join an in-flight attempt instead of replacing it.
    pub fn deduplicate() -> Self {
        Self::default().cancel_refetch(false)
    }

    /// Set whether an in-flight attempt is replaced.
    pub fn cancel_refetch(mut self, cancel_refetch: bool) -> Self {
        self.cancel_refetch = cancel_refetch;
        self
    }

    /// Attach request-scoped metadata.
    pub fn meta(mut self, meta: impl Into<KeySegment>) -> Self {
        self.meta = Some(meta.into());
        self
    }
}
