//! A single cached query and its fetch state machine.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::UsageError;
use crate::key::{self, KeySegment, QueryKey};
use crate::options::{FetchOptions, QueryOptions};
use crate::signal::{AbortReason, AbortSignal};
use crate::slot::{FetchHandle, FetchSlot};
use crate::tracer::{FetchOutcome, NoopTracer, Tracer};
use crate::QueryError;

/// Whether a query has data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    /// Never fetched and no data.
    #[default]
    Idle,
    /// A first fetch is running and there is no data yet.
    Pending,
    /// The last settled fetch (or manual write) produced data.
    Success,
    /// The last settled fetch failed.
    Error,
}

/// Whether a query is doing work right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FetchStatus {
    /// No attempt in flight.
    #[default]
    Idle,
    /// The work function is running.
    Fetching,
    /// An attempt is installed but waits for connectivity.
    Paused,
}

/// Snapshot of a query's cached state.
#[derive(Debug)]
pub struct QueryState<T> {
    /// Data status.
    pub status: QueryStatus,
    /// Fetch activity.
    pub fetch_status: FetchStatus,
    /// Last successful data. Kept when a later fetch fails.
    pub data: Option<Arc<T>>,
    /// Error of the last failed fetch, cleared by the next success.
    pub error: Option<QueryError>,
    /// When `data` was last written.
    pub data_updated_at: Option<Instant>,
    /// When `error` was last written.
    pub error_updated_at: Option<Instant>,
    /// Number of times `data` was written.
    pub data_update_count: u64,
    /// Number of times `error` was written.
    pub error_update_count: u64,
    /// Consecutive failed fetches since the last success.
    pub fetch_failure_count: u32,
    /// Set by [`Query::invalidate`], cleared when new data lands.
    pub is_invalidated: bool,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            status: QueryStatus::Idle,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            data_updated_at: None,
            error_updated_at: None,
            data_update_count: 0,
            error_update_count: 0,
            fetch_failure_count: 0,
            is_invalidated: false,
        }
    }
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            fetch_status: self.fetch_status,
            data: self.data.clone(),
            error: self.error.clone(),
            data_updated_at: self.data_updated_at,
            error_updated_at: self.error_updated_at,
            data_update_count: self.data_update_count,
            error_update_count: self.error_update_count,
            fetch_failure_count: self.fetch_failure_count,
            is_invalidated: self.is_invalidated,
        }
    }
}

impl<T> QueryState<T> {
    /// Returns true if an attempt is in flight (running or paused).
    pub fn is_fetching(&self) -> bool {
        self.fetch_status != FetchStatus::Idle
    }

    fn apply_success(&mut self, data: Arc<T>) {
        self.status = QueryStatus::Success;
        self.data = Some(data);
        self.error = None;
        self.data_updated_at = Some(Instant::now());
        self.data_update_count += 1;
        self.fetch_failure_count = 0;
        self.is_invalidated = false;
    }

    fn apply_error(&mut self, error: QueryError) {
        self.status = QueryStatus::Error;
        self.error = Some(error);
        self.error_updated_at = Some(Instant::now());
        self.error_update_count += 1;
        self.fetch_failure_count += 1;
    }
}

/// Context handed to a work function for one invocation.
#[derive(Debug, Clone)]
pub struct FetchContext {
    key: QueryKey,
    signal: AbortSignal,
    invocation: u64,
    meta: Option<KeySegment>,
}

impl FetchContext {
    /// Key of the query being fetched.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Abort signal of this invocation.
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Invocation number, starting at 1 for the first started work function.
    pub fn invocation(&self) -> u64 {
        self.invocation
    }

    /// Metadata passed through [`FetchOptions::meta`].
    pub fn meta(&self) -> Option<&KeySegment> {
        self.meta.as_ref()
    }
}

/// The asynchronous work function of a query.
///
/// Implemented for every `Fn(FetchContext) -> impl Future<Output = Result<T, QueryError>>`,
/// so closures and `async fn`s can be used directly.
///
/// Work functions must not return [`QueryError::Aborted`] unless their signal
/// was aborted; the engine relies on it to tell cancellations from failures.
#[async_trait]
pub trait QueryFn<T>: Send + Sync + 'static {
    /// Run one invocation.
    async fn fetch(&self, ctx: FetchContext) -> Result<T, QueryError>;
}

#[async_trait]
impl<T, F, Fut> QueryFn<T> for F
where
    F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    T: Send + 'static,
{
    async fn fetch(&self, ctx: FetchContext) -> Result<T, QueryError> {
        (self)(ctx).await
    }
}

struct QueryInner<T> {
    state: QueryState<T>,
    slot: Option<FetchSlot<T>>,
    invocations: u64,
    disposed: bool,
}

impl<T> QueryInner<T> {
    /// Remove the in-flight slot, restoring the status it displaced.
    fn take_in_flight(&mut self) -> Option<FetchSlot<T>> {
        let slot = self.slot.take()?;
        self.state.status = slot.revert_status();
        self.state.fetch_status = FetchStatus::Idle;
        Some(slot)
    }
}

/// A cached query: one key, its state, and at most one in-flight fetch.
///
/// Queries are shared as `Arc<Query<T>>`; work functions only keep a weak
/// reference, so an attempt that outlives its query is silently dropped.
///
/// # Example
///
/// ```ignore
/// use query_cache::{query_key, FetchContext, FetchOptions, Query, QueryError};
///
/// let query = Query::new(query_key!["users", 1], |ctx: FetchContext| async move {
///     let user = ctx.signal().run(load_user(1)).await??;
///     Ok::<_, QueryError>(user)
/// });
///
/// let user = query.fetch(FetchOptions::default())?.await?;
/// ```
pub struct Query<T> {
    key: QueryKey,
    options: QueryOptions,
    query_fn: Arc<dyn QueryFn<T>>,
    tracer: Arc<dyn Tracer>,
    online: Option<watch::Receiver<bool>>,
    inner: Mutex<QueryInner<T>>,
}

/// Builder for a standalone [`Query`].
pub struct QueryBuilder<T> {
    key: QueryKey,
    query_fn: Arc<dyn QueryFn<T>>,
    options: QueryOptions,
    tracer: Arc<dyn Tracer>,
    online: Option<watch::Receiver<bool>>,
}

impl<T: Send + Sync + 'static> QueryBuilder<T> {
    /// Set the query options.
    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the tracer receiving this query's events.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    pub(crate) fn shared_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub(crate) fn online(mut self, online: watch::Receiver<bool>) -> Self {
        self.online = Some(online);
        self
    }

    /// Build the query.
    pub fn build(self) -> Arc<Query<T>> {
        Arc::new(Query {
            key: self.key,
            options: self.options,
            query_fn: self.query_fn,
            tracer: self.tracer,
            online: self.online,
            inner: Mutex::new(QueryInner {
                state: QueryState::default(),
                slot: None,
                invocations: 0,
                disposed: false,
            }),
        })
    }
}

impl<T: Send + Sync + 'static> Query<T> {
    /// Create a query with default options.
    pub fn new(key: impl Into<QueryKey>, query_fn: impl QueryFn<T>) -> Arc<Self> {
        Self::builder(key, query_fn).build()
    }

    /// Create a builder for customizing the query.
    pub fn builder(key: impl Into<QueryKey>, query_fn: impl QueryFn<T>) -> QueryBuilder<T> {
        QueryBuilder {
            key: key.into(),
            query_fn: Arc::new(query_fn),
            options: QueryOptions::default(),
            tracer: Arc::new(NoopTracer),
            online: None,
        }
    }

    /// Key of this query.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Options this query was created with.
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState<T> {
        self.inner.lock().state.clone()
    }

    /// Cached data, if any.
    pub fn data(&self) -> Option<Arc<T>> {
        self.inner.lock().state.data.clone()
    }

    /// Number of work-function invocations started so far.
    pub fn invocation_count(&self) -> u64 {
        self.inner.lock().invocations
    }

    /// Returns true if an attempt is in flight.
    pub fn is_fetching(&self) -> bool {
        self.inner.lock().slot.is_some()
    }

    /// Returns true after [`dispose`](Self::dispose).
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Returns true if the data should be refetched: invalidated, missing, or
    /// older than `stale_time`.
    pub fn is_stale(&self) -> bool {
        let inner = self.inner.lock();
        let state = &inner.state;
        state.is_invalidated
            || state.data.is_none()
            || state
                .data_updated_at
                .map_or(true, |at| at.elapsed() >= self.options.stale_time)
    }

    /// Request data for this query.
    ///
    /// - No attempt in flight: start the work function.
    /// - In flight and `cancel_refetch` is false: join the running attempt.
    /// - In flight and `cancel_refetch` is true: abort the running attempt,
    ///   start a new one, and move every caller of the old attempt onto it.
    ///
    /// The decision and installation of the new attempt happen under the
    /// query lock, so concurrent calls never interleave. Every failure of the
    /// attempt is delivered through the returned handle; only misuse fails here.
    pub fn fetch(self: &Arc<Self>, options: FetchOptions) -> Result<FetchHandle<T>, UsageError> {
        let runtime = Handle::try_current().map_err(|_| UsageError::NoRuntime)?;

        let mut inner = self.inner.lock();
        if inner.disposed {
            return Err(UsageError::Disposed {
                key: self.key.clone(),
            });
        }

        let superseded = match inner.slot.take() {
            Some(mut slot) if !options.cancel_refetch => {
                let handle = slot.push_waiter();
                let joined = slot.invocation();
                inner.slot = Some(slot);
                drop(inner);

                self.tracer.on_fetch_deduplicated(&self.key, joined);
                return Ok(handle);
            }
            superseded => superseded,
        };

        inner.invocations += 1;
        let invocation = inner.invocations;
        let revert_status = superseded
            .as_ref()
            .map_or(inner.state.status, FetchSlot::revert_status);
        let mut slot = FetchSlot::new(invocation, revert_status);
        let superseded = superseded.map(|superseded| {
            superseded.abort(AbortReason::Superseded);
            let id = superseded.invocation();
            slot.adopt_waiters(superseded);
            id
        });
        let handle = slot.push_waiter();

        let ctx = FetchContext {
            key: self.key.clone(),
            signal: slot.signal().clone(),
            invocation,
            meta: options.meta,
        };
        if inner.state.status == QueryStatus::Idle {
            inner.state.status = QueryStatus::Pending;
        }
        inner.state.fetch_status = if self.is_online() {
            FetchStatus::Fetching
        } else {
            FetchStatus::Paused
        };
        inner.slot = Some(slot);
        drop(inner);

        // tracer hooks run unlocked
        if let Some(superseded) = superseded {
            self.tracer
                .on_fetch_superseded(&self.key, superseded, invocation);
        }
        self.tracer.on_fetch_start(&self.key, invocation);
        runtime.spawn(run_attempt(
            Arc::downgrade(self),
            self.query_fn.clone(),
            self.online.clone(),
            ctx,
        ));
        Ok(handle)
    }

    /// Cancel the in-flight attempt, if any.
    ///
    /// Its waiters are rejected with [`QueryError::Aborted`] and the status
    /// reverts to what it was before the attempt started. Cached data is kept.
    /// Returns true if an attempt was cancelled.
    pub fn cancel(&self) -> bool {
        let slot = self.inner.lock().take_in_flight();
        match slot {
            Some(slot) => {
                self.reject(slot, AbortReason::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Write data directly, as if a fetch had succeeded.
    ///
    /// An in-flight attempt keeps running and overwrites this value when it settles.
    pub fn set_data(&self, data: T) -> Arc<T> {
        let data = Arc::new(data);
        self.inner.lock().state.apply_success(data.clone());
        data
    }

    /// Mark the data as stale regardless of `stale_time`.
    pub fn invalidate(&self) {
        self.inner.lock().state.is_invalidated = true;
    }

    /// Cancel the in-flight attempt and restore the initial state.
    pub fn reset(&self) {
        let slot = {
            let mut inner = self.inner.lock();
            let slot = inner.slot.take();
            inner.state = QueryState::default();
            slot
        };
        if let Some(slot) = slot {
            self.reject(slot, AbortReason::Cancelled);
        }
    }

    /// Abort the in-flight attempt and refuse further fetches.
    pub fn dispose(&self) {
        let slot = {
            let mut inner = self.inner.lock();
            inner.disposed = true;
            inner.take_in_flight()
        };
        if let Some(slot) = slot {
            self.reject(slot, AbortReason::Disposed);
        }
    }

    /// Match this query's key against `filter`. See [`key::matches_key`].
    pub fn matches(&self, filter: &QueryKey, exact: bool) -> bool {
        key::matches_key(&self.key, filter, exact)
    }

    /// Evaluate `predicate` against this query.
    pub fn matches_where(&self, predicate: impl FnOnce(&Self) -> bool) -> bool {
        key::matches_where(self, predicate)
    }

    fn reject(&self, slot: FetchSlot<T>, reason: AbortReason) {
        slot.abort(reason.clone());
        self.tracer
            .on_fetch_cancelled(&self.key, slot.invocation(), &reason);
        slot.resolve(Err(QueryError::Aborted { reason }));
    }

    fn is_online(&self) -> bool {
        self.online.as_ref().map_or(true, |online| *online.borrow())
    }

    fn set_fetch_status(&self, invocation: u64, fetch_status: FetchStatus) {
        let mut inner = self.inner.lock();
        if inner
            .slot
            .as_ref()
            .is_some_and(|slot| slot.invocation() == invocation)
        {
            inner.state.fetch_status = fetch_status;
        }
    }

    /// Publish the outcome of `invocation` if it is still the current attempt.
    fn settle(&self, invocation: u64, result: Result<T, QueryError>) {
        let mut inner = self.inner.lock();
        let slot = match inner.slot.take() {
            Some(slot) if slot.invocation() == invocation => slot,
            other => {
                inner.slot = other;
                drop(inner);
                self.tracer.on_fetch_discarded(&self.key, invocation);
                return;
            }
        };

        inner.state.fetch_status = FetchStatus::Idle;
        let (outcome, result) = match result {
            Ok(data) => {
                let data = Arc::new(data);
                inner.state.apply_success(data.clone());
                (FetchOutcome::Success, Ok(data))
            }
            // cancellation is not a data error: leave data and error alone
            Err(error) if error.is_aborted() => {
                inner.state.status = slot.revert_status();
                (FetchOutcome::Aborted, Err(error))
            }
            Err(error) => {
                inner.state.apply_error(error.clone());
                let message = error.to_string();
                (FetchOutcome::Error { message }, Err(error))
            }
        };
        drop(inner);

        self.tracer.on_fetch_settled(&self.key, invocation, &outcome);
        slot.resolve(result);
    }
}

/// Body of the task spawned for each invocation.
async fn run_attempt<T: Send + Sync + 'static>(
    query: Weak<Query<T>>,
    query_fn: Arc<dyn QueryFn<T>>,
    online: Option<watch::Receiver<bool>>,
    ctx: FetchContext,
) {
    let invocation = ctx.invocation();
    let result = match wait_until_online(&query, online, &ctx).await {
        Ok(()) => {
            // connectivity may have returned before this task first ran
            if let Some(query) = query.upgrade() {
                query.set_fetch_status(invocation, FetchStatus::Fetching);
            }
            AssertUnwindSafe(query_fn.fetch(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(QueryError::Panicked(panic_message(payload))))
        }
        Err(error) => Err(error),
    };
    if let Some(query) = query.upgrade() {
        query.settle(invocation, result);
    }
}

async fn wait_until_online<T: Send + Sync + 'static>(
    query: &Weak<Query<T>>,
    online: Option<watch::Receiver<bool>>,
    ctx: &FetchContext,
) -> Result<(), QueryError> {
    let Some(mut online) = online else {
        return Ok(());
    };
    if *online.borrow_and_update() {
        return Ok(());
    }

    if let Some(query) = query.upgrade() {
        query.set_fetch_status(ctx.invocation(), FetchStatus::Paused);
        query.tracer.on_fetch_paused(&query.key, ctx.invocation());
    }
    // a closed channel means the client is gone; run rather than wait forever
    ctx.signal()
        .run(async {
            let _ = online.wait_for(|online| *online).await.map(|_| ());
        })
        .await?;
    Ok(())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl<T> Drop for Query<T> {
    fn drop(&mut self) {
        if let Some(slot) = &self.inner.get_mut().slot {
            slot.abort(AbortReason::Disposed);
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("status", &inner.state.status)
            .field("fetch_status", &inner.state.fetch_status)
            .field("invocations", &inner.invocations)
            .finish()
    }
}

/// Type-erased view of a [`Query`], used by the client for selection and bulk operations.
pub trait DynQuery: Send + Sync + 'static {
    /// Key of the query.
    fn key(&self) -> &QueryKey;

    /// Current data status.
    fn status(&self) -> QueryStatus;

    /// Current fetch activity.
    fn fetch_status(&self) -> FetchStatus;

    /// See [`Query::is_stale`].
    fn is_stale(&self) -> bool;

    /// Returns true if the query was invalidated since its last data write.
    fn is_invalidated(&self) -> bool;

    /// See [`Query::invocation_count`].
    fn invocation_count(&self) -> u64;

    /// Name of the data type, for diagnostics.
    fn data_type_name(&self) -> &'static str;

    /// See [`Query::cancel`].
    fn cancel(&self) -> bool;

    /// See [`Query::invalidate`].
    fn invalidate(&self);

    /// See [`Query::dispose`].
    fn dispose(&self);

    /// Start a fetch without waiting for its outcome.
    fn refetch(self: Arc<Self>, options: FetchOptions) -> Result<(), UsageError>;

    /// Convert to `Any` for downcasting to the typed query.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Match the key against `filter`. See [`key::matches_key`].
    fn matches(&self, filter: &QueryKey, exact: bool) -> bool {
        key::matches_key(self.key(), filter, exact)
    }
}

impl<T: Send + Sync + 'static> DynQuery for Query<T> {
    fn key(&self) -> &QueryKey {
        &self.key
    }

    fn status(&self) -> QueryStatus {
        self.inner.lock().state.status
    }

    fn fetch_status(&self) -> FetchStatus {
        self.inner.lock().state.fetch_status
    }

    fn is_stale(&self) -> bool {
        Query::is_stale(self)
    }

    fn is_invalidated(&self) -> bool {
        self.inner.lock().state.is_invalidated
    }

    fn invocation_count(&self) -> u64 {
        Query::invocation_count(self)
    }

    fn data_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn cancel(&self) -> bool {
        Query::cancel(self)
    }

    fn invalidate(&self) {
        Query::invalidate(self)
    }

    fn dispose(&self) {
        Query::dispose(self)
    }

    fn refetch(self: Arc<Self>, options: FetchOptions) -> Result<(), UsageError> {
        // the attempt keeps running without a waiter; its outcome lands in the state
        Query::fetch(&self, options).map(drop)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
