//! Multi-criterion query selection.

use std::fmt;
use std::sync::Arc;

use crate::key::{self, QueryKey};
use crate::query::{DynQuery, FetchStatus};

type Predicate = Arc<dyn Fn(&dyn DynQuery) -> bool + Send + Sync>;

/// Criteria for selecting queries from a [`QueryClient`](crate::QueryClient).
///
/// A query is selected when it satisfies every criterion that is set. An empty
/// filter selects everything.
///
/// # Example
///
/// ```
/// use query_cache::{query_key, FetchStatus, QueryFilters};
///
/// let filters = QueryFilters::new()
///     .key(query_key!["users"])
///     .fetch_status(FetchStatus::Idle)
///     .stale(true);
/// ```
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Key to match, by prefix unless `exact` is set.
    pub query_key: Option<QueryKey>,
    /// Require `query_key` to match exactly.
    pub exact: bool,
    /// Required fetch activity.
    pub fetch_status: Option<FetchStatus>,
    /// Required staleness.
    pub stale: Option<bool>,
    /// Arbitrary predicate over the query.
    pub predicate: Option<Predicate>,
}

impl QueryFilters {
    /// A filter that selects every query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select queries whose key starts with `key`.
    pub fn key(mut self, key: impl Into<QueryKey>) -> Self {
        self.query_key = Some(key.into());
        self.exact = false;
        self
    }

    /// Select the query whose key is exactly `key`.
    pub fn exact_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.query_key = Some(key.into());
        self.exact = true;
        self
    }

    /// Select queries with the given fetch activity.
    pub fn fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    /// Select stale (`true`) or fresh (`false`) queries.
    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    /// Select queries for which `predicate` returns true.
    pub fn predicate(
        mut self,
        predicate: impl Fn(&dyn DynQuery) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Returns true if `query` satisfies every criterion.
    pub fn matches(&self, query: &dyn DynQuery) -> bool {
        if let Some(filter) = &self.query_key {
            if !query.matches(filter, self.exact) {
                return false;
            }
        }
        if let Some(fetch_status) = self.fetch_status {
            if query.fetch_status() != fetch_status {
                return false;
            }
        }
        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }
        match &self.predicate {
            Some(predicate) => key::matches_where(query, |query| predicate(query)),
            None => true,
        }
    }
}

impl fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("fetch_status", &self.fetch_status)
            .field("stale", &self.stale)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
