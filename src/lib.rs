//! Query-Cache: a client-side data cache that coalesces concurrent fetches.
//!
//! Every cached entry is a [`Query`] identified by a hierarchical [`QueryKey`].
//! Fetch requests for the same query are deduplicated onto one in-flight
//! attempt, or cancel it and move its callers onto a replacement. Either way
//! each caller sees exactly one outcome and never a cancellation it did not ask
//! for.
//!
//! # Key Features
//!
//! - **Deduplication**: concurrent fetches share one invocation of the work function
//! - **Cancel-and-replace**: a refetch aborts the running attempt and its callers
//!   receive the replacement's outcome
//! - **Cooperative cancellation**: work functions observe an [`AbortSignal`]
//! - **Hierarchical keys**: select queries by key prefix, exact key, or predicate
//! - **Observability**: plug in a [`Tracer`] to see every decision the engine makes
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{query_key, FetchContext, FetchOptions, QueryClient, QueryError};
//!
//! let client = QueryClient::new();
//! let user = client.query(query_key!["users", 1], |ctx: FetchContext| async move {
//!     let response = ctx.signal().run(http_get("/users/1")).await??;
//!     Ok::<_, QueryError>(response)
//! })?;
//!
//! // Both callers observe the same invocation.
//! let first = user.fetch(FetchOptions::default())?;
//! let second = user.fetch(FetchOptions::deduplicate())?;
//! assert!(std::sync::Arc::ptr_eq(&first.await?, &second.await?));
//! ```
//!
//! # Work functions
//!
//! Nothing preempts a running work function. It should check
//! [`AbortSignal::throw_if_aborted`] after every `.await`, or wrap awaited
//! futures in [`AbortSignal::run`]. An attempt that ignores its signal runs to
//! completion, and its outcome is discarded if it was replaced in the meantime.

#![deny(missing_docs)]

mod client;
mod error;
mod filters;
mod key;
mod options;
mod query;
mod signal;
mod slot;
pub mod tracer;

pub use client::{QueryClient, QueryClientBuilder};
pub use error::{QueryError, QueryResultExt, TypedErr, UsageError};
pub use filters::QueryFilters;
pub use key::{matches_key, matches_where, KeySegment, QueryKey};
pub use options::{FetchOptions, QueryOptions};
pub use query::{
    DynQuery, FetchContext, FetchStatus, Query, QueryBuilder, QueryFn, QueryState, QueryStatus,
};
pub use signal::{AbortReason, AbortSignal};
pub use slot::FetchHandle;
pub use tracer::{FetchOutcome, NoopTracer, Tracer};

#[cfg(feature = "tracing")]
pub use tracer::TracingTracer;
