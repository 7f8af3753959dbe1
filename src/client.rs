//! Query registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::UsageError;
use crate::filters::QueryFilters;
use crate::key::QueryKey;
use crate::options::{FetchOptions, QueryOptions};
use crate::query::{DynQuery, Query, QueryFn};
use crate::slot::FetchHandle;
use crate::tracer::{NoopTracer, Tracer};

struct ClientInner {
    queries: RwLock<HashMap<QueryKey, Arc<dyn DynQuery>>>,
    default_options: QueryOptions,
    tracer: Arc<dyn Tracer>,
    online: watch::Sender<bool>,
}

/// Registry of queries keyed by [`QueryKey`].
///
/// The client creates each query on first reference to its key and hands out
/// the same `Arc<Query<T>>` afterwards. It also owns the connectivity flag that
/// pauses fetches while offline.
///
/// This is cheap to clone - all data is behind `Arc`.
///
/// # Example
///
/// ```ignore
/// let client = QueryClient::new();
/// let todos = client.query(query_key!["todos"], |ctx: FetchContext| fetch_todos(ctx))?;
/// let list = todos.fetch(FetchOptions::default())?.await?;
///
/// client.invalidate_queries(&QueryFilters::new().key(query_key!["todos"]));
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// Create a client with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the client.
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::new()
    }

    /// Get the query for `key`, creating it with the client's default options.
    ///
    /// `query_fn` is only used when the query is created.
    ///
    /// # Errors
    ///
    /// - `UsageError::TypeMismatch` - `key` already holds a query of another data type
    pub fn query<T, F>(
        &self,
        key: impl Into<QueryKey>,
        query_fn: F,
    ) -> Result<Arc<Query<T>>, UsageError>
    where
        T: Send + Sync + 'static,
        F: QueryFn<T>,
    {
        self.query_with_options(key, query_fn, self.inner.default_options.clone())
    }

    /// Get the query for `key`, creating it with `options`.
    ///
    /// Options of an existing query are left unchanged.
    pub fn query_with_options<T, F>(
        &self,
        key: impl Into<QueryKey>,
        query_fn: F,
        options: QueryOptions,
    ) -> Result<Arc<Query<T>>, UsageError>
    where
        T: Send + Sync + 'static,
        F: QueryFn<T>,
    {
        let key = key.into();
        let mut queries = self.inner.queries.write();
        if let Some(existing) = queries.get(&key) {
            return downcast(existing.clone(), &key);
        }

        let query = Query::builder(key.clone(), query_fn)
            .options(options)
            .shared_tracer(self.inner.tracer.clone())
            .online(self.inner.online.subscribe())
            .build();
        queries.insert(key.clone(), query.clone());
        drop(queries);

        self.inner.tracer.on_query_created(&key);
        Ok(query)
    }

    /// Get the typed query registered under `key`.
    ///
    /// Returns `None` if there is no query or it holds another data type.
    pub fn get<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<Arc<Query<T>>> {
        let existing = self.inner.queries.read().get(key).cloned()?;
        downcast(existing, key).ok()
    }

    /// Get the type-erased query registered under `key`.
    pub fn get_dyn(&self, key: &QueryKey) -> Option<Arc<dyn DynQuery>> {
        self.inner.queries.read().get(key).cloned()
    }

    /// Cached data of the query under `key`.
    pub fn get_query_data<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<Arc<T>> {
        self.get::<T>(key)?.data()
    }

    /// Overwrite the data of an existing query. See [`Query::set_data`].
    ///
    /// Returns `None` if there is no query of type `T` under `key`.
    pub fn set_query_data<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
        data: T,
    ) -> Option<Arc<T>> {
        Some(self.get::<T>(key)?.set_data(data))
    }

    /// Return fresh cached data, or fetch it.
    ///
    /// Cached data that is not stale resolves immediately. Otherwise the fetch
    /// joins an in-flight attempt if there is one.
    pub fn fetch_query<T, F>(
        &self,
        key: impl Into<QueryKey>,
        query_fn: F,
    ) -> Result<FetchHandle<T>, UsageError>
    where
        T: Send + Sync + 'static,
        F: QueryFn<T>,
    {
        let query = self.query(key, query_fn)?;
        if !query.is_stale() {
            if let Some(data) = query.data() {
                return Ok(FetchHandle::ready(data));
            }
        }
        query.fetch(FetchOptions::deduplicate())
    }

    /// All queries matching `filters`, ordered by key.
    ///
    /// Filters are evaluated without holding the registry lock, so predicates
    /// may call back into the client.
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Arc<dyn DynQuery>> {
        let mut found: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|query| filters.matches(query.as_ref()))
            .collect();
        found.sort_by(|a, b| a.key().cmp(b.key()));
        found
    }

    /// The first query matching `filters`, by key order.
    pub fn find(&self, filters: &QueryFilters) -> Option<Arc<dyn DynQuery>> {
        self.find_all(filters).into_iter().next()
    }

    /// Cancel the in-flight attempt of every matching query.
    ///
    /// Returns how many attempts were cancelled.
    pub fn cancel_queries(&self, filters: &QueryFilters) -> usize {
        self.find_all(filters)
            .into_iter()
            .filter(|query| query.cancel())
            .count()
    }

    /// Mark every matching query stale. Returns how many were matched.
    pub fn invalidate_queries(&self, filters: &QueryFilters) -> usize {
        let queries = self.find_all(filters);
        for query in &queries {
            query.invalidate();
        }
        queries.len()
    }

    /// Start a fetch on every matching query without waiting for the outcomes.
    ///
    /// Returns how many fetches were requested.
    pub fn refetch_queries(&self, filters: &QueryFilters, options: FetchOptions) -> usize {
        self.find_all(filters)
            .into_iter()
            .filter(|query| query.clone().refetch(options.clone()).is_ok())
            .count()
    }

    /// Remove and dispose every matching query. Returns how many were removed.
    pub fn remove_queries(&self, filters: &QueryFilters) -> usize {
        let matched = self.find_all(filters);
        let removed: Vec<_> = {
            let mut queries = self.inner.queries.write();
            matched
                .into_iter()
                .filter(|query| {
                    // skip entries replaced since they were matched
                    let current = queries.get(query.key());
                    if current.is_some_and(|current| Arc::ptr_eq(current, query)) {
                        queries.remove(query.key());
                        true
                    } else {
                        false
                    }
                })
                .collect()
        };
        for query in &removed {
            self.dispose(query.as_ref());
        }
        removed.len()
    }

    /// Remove and dispose the query under `key`.
    pub fn remove(&self, key: &QueryKey) -> bool {
        let removed = self.inner.queries.write().remove(key);
        match removed {
            Some(query) => {
                self.dispose(query.as_ref());
                true
            }
            None => false,
        }
    }

    /// Remove and dispose every query.
    pub fn clear(&self) {
        let removed: Vec<_> = self.inner.queries.write().drain().map(|(_, q)| q).collect();
        for query in &removed {
            self.dispose(query.as_ref());
        }
    }

    /// Number of registered queries.
    pub fn len(&self) -> usize {
        self.inner.queries.read().len()
    }

    /// Returns true if no query is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.queries.read().is_empty()
    }

    /// Keys of all registered queries, sorted.
    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<_> = self.inner.queries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Set connectivity. Going online resumes paused fetches.
    pub fn set_online(&self, online: bool) {
        self.inner.online.send_replace(online);
    }

    /// Current connectivity.
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    fn snapshot(&self) -> Vec<Arc<dyn DynQuery>> {
        self.inner.queries.read().values().cloned().collect()
    }

    fn dispose(&self, query: &dyn DynQuery) {
        query.dispose();
        self.inner.tracer.on_query_removed(query.key());
    }
}

fn downcast<T: Send + Sync + 'static>(
    query: Arc<dyn DynQuery>,
    key: &QueryKey,
) -> Result<Arc<Query<T>>, UsageError> {
    query
        .as_any()
        .downcast::<Query<T>>()
        .map_err(|_| UsageError::TypeMismatch {
            key: key.clone(),
            expected: std::any::type_name::<T>(),
        })
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder {
    default_options: QueryOptions,
    tracer: Arc<dyn Tracer>,
    online: bool,
}

impl Default for QueryClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClientBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            default_options: QueryOptions::default(),
            tracer: Arc::new(NoopTracer),
            online: true,
        }
    }

    /// Options for queries created through [`QueryClient::query`].
    pub fn default_options(mut self, options: QueryOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Tracer shared by the client and every query it creates.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Initial connectivity. Defaults to online.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Build the client with the configured settings.
    pub fn build(self) -> QueryClient {
        let (online, _) = watch::channel(self.online);
        QueryClient {
            inner: Arc::new(ClientInner {
                queries: RwLock::new(HashMap::new()),
                default_options: self.default_options,
                tracer: self.tracer,
                online,
            }),
        }
    }
}
