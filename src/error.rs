//! Error types for fetch execution.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::key::QueryKey;
use crate::signal::AbortReason;

/// Errors delivered through a [`FetchHandle`](crate::FetchHandle) and cached in
/// [`QueryState::error`](crate::QueryState::error).
///
/// User errors can be propagated from a work function using the `?` operator,
/// which converts any `Into<anyhow::Error>` type into `QueryError::UserError`.
#[derive(Debug, Clone)]
pub enum QueryError {
    /// The attempt observed its abort signal.
    ///
    /// Work functions produce this through [`AbortSignal::throw_if_aborted`](crate::AbortSignal::throw_if_aborted).
    /// A caller that was deduplicated or piggybacked onto a surviving attempt never
    /// sees it; it only reaches callers of a query that was explicitly cancelled
    /// or disposed.
    Aborted {
        /// Why the signal was aborted.
        reason: AbortReason,
    },

    /// The work function panicked.
    Panicked(String),

    /// Error raised by the work function.
    ///
    /// Unlike `Aborted`, user errors are stored in the query state and delivered
    /// verbatim to every waiter of the attempt.
    UserError(Arc<anyhow::Error>),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::Aborted { reason } => write!(f, "fetch aborted: {}", reason),
            QueryError::Panicked(message) => write!(f, "work function panicked: {}", message),
            QueryError::UserError(e) => write!(f, "user error: {}", e),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for QueryError {
    fn from(err: T) -> Self {
        QueryError::UserError(Arc::new(err.into()))
    }
}

impl QueryError {
    /// Returns `true` if this error is a cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, QueryError::Aborted { .. })
    }

    /// Returns a reference to the inner user error if this is a `UserError` variant.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            QueryError::UserError(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `UserError` containing an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }
}

/// Misuse of the API, reported synchronously and never cached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    /// The query was disposed and can no longer fetch.
    #[error("query {key:?} has been disposed")]
    Disposed {
        /// Key of the disposed query.
        key: QueryKey,
    },

    /// `fetch` was called outside of a tokio runtime.
    #[error("fetch must be called from within a tokio runtime")]
    NoRuntime,

    /// The key is already registered with a different data type.
    #[error("query {key:?} is registered with a data type other than {expected}")]
    TypeMismatch {
        /// The conflicting key.
        key: QueryKey,
        /// Type name that was requested.
        expected: &'static str,
    },
}

/// A typed wrapper around a user error that provides `Deref` access to the inner error type.
///
/// The wrapper keeps the `Arc` alive, so the downcast reference stays valid for
/// as long as the wrapper exists.
#[derive(Clone)]
pub struct TypedErr<E> {
    arc: Arc<anyhow::Error>,
    _marker: PhantomData<E>,
}

impl<E: std::error::Error + Send + Sync + 'static> TypedErr<E> {
    fn new(arc: Arc<anyhow::Error>) -> Option<Self> {
        arc.downcast_ref::<E>()?;
        Some(Self {
            arc,
            _marker: PhantomData,
        })
    }

    /// Returns a reference to the inner error.
    pub fn get(&self) -> &E {
        match self.arc.downcast_ref::<E>() {
            Some(e) => e,
            // checked in `new`
            None => unreachable!("TypedErr holds an error of another type"),
        }
    }
}

impl<E: std::error::Error + Send + Sync + 'static> Deref for TypedErr<E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.get()
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Debug for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.get(), f)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Display for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.get(), f)
    }
}

/// Extension trait for fetch results that provides ergonomic error downcasting.
///
/// # Example
///
/// ```ignore
/// use query_cache::QueryResultExt;
///
/// match query.fetch(FetchOptions::default())?.await.downcast_err::<NotFound>()? {
///     Ok(user) => println!("user: {:?}", user),
///     Err(not_found) => println!("missing: {}", not_found.id),
/// }
/// ```
pub trait QueryResultExt<T> {
    /// Attempts to downcast a `UserError` to a specific error type.
    ///
    /// - `Ok(Ok(value))` - the fetch succeeded
    /// - `Ok(Err(typed_err))` - the fetch failed with a `UserError` of type `E`
    /// - `Err(query_error)` - any other failure
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<Arc<T>, TypedErr<E>>, QueryError>;
}

impl<T> QueryResultExt<T> for Result<Arc<T>, QueryError> {
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<Arc<T>, TypedErr<E>>, QueryError> {
        match self {
            Ok(value) => Ok(Ok(value)),
            Err(QueryError::UserError(arc)) => match TypedErr::new(arc.clone()) {
                Some(typed) => Ok(Err(typed)),
                None => Err(QueryError::UserError(arc)),
            },
            Err(other) => Err(other),
        }
    }
}
