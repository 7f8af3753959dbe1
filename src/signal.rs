//! Cooperative, one-shot cancellation.
//!
//! An [`AbortSignal`] is handed to every work function through its
//! [`FetchContext`](crate::FetchContext). Nothing preempts a running work
//! function: it must check the signal after each suspension point, either with
//! [`AbortSignal::throw_if_aborted`] or by wrapping the awaited future in
//! [`AbortSignal::run`].

use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{select, Either};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::QueryError;

/// Why a signal was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// A newer attempt replaced this one (cancel-and-replace).
    Superseded,
    /// The query was cancelled explicitly.
    Cancelled,
    /// The query was disposed or removed from its client.
    Disposed,
    /// Aborted by user code, e.g. a deadline.
    Custom(Arc<str>),
}

impl AbortReason {
    /// Create a custom reason.
    pub fn custom(message: impl Into<Arc<str>>) -> Self {
        AbortReason::Custom(message.into())
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Superseded => write!(f, "superseded by a newer fetch"),
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::Disposed => write!(f, "query disposed"),
            AbortReason::Custom(message) => write!(f, "{}", message),
        }
    }
}

#[derive(Default)]
struct SignalInner {
    aborted: AtomicBool,
    reason: Mutex<Option<AbortReason>>,
    notify: Notify,
}

/// One-shot cancellation token.
///
/// Cloning is cheap and every clone observes the same flag. Once aborted, a
/// signal stays aborted and keeps the reason of the first `abort` call.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    /// Create a signal that is not aborted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the signal and wake everyone waiting in [`aborted`](Self::aborted).
    ///
    /// Only the first call has an effect; later calls keep the original reason.
    /// Returns `true` if this call aborted the signal.
    pub fn abort(&self, reason: AbortReason) -> bool {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            // set under the lock so `reason()` is never `None` once the flag is visible
            self.inner.aborted.store(true, Ordering::Release);
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Returns `true` once [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// The reason recorded by the first `abort` call.
    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.reason.lock().clone()
    }

    /// Wait until the signal is aborted.
    ///
    /// Resolves immediately if the signal is already aborted.
    pub async fn aborted(&self) {
        let notified = self.inner.notify.notified();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }

    /// Fail with [`QueryError::Aborted`] if the signal is aborted.
    ///
    /// Call this right after every `.await` in a work function so that an
    /// attempt finishing just as the abort arrives settles as a cancellation.
    pub fn throw_if_aborted(&self) -> Result<(), QueryError> {
        match self.reason() {
            Some(reason) => Err(QueryError::Aborted { reason }),
            None => Ok(()),
        }
    }

    /// Drive `future` until it completes or the signal is aborted.
    ///
    /// A future that completes after the abort still yields `Err(Aborted)`.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, QueryError> {
        let future = pin!(future);
        let aborted = pin!(self.aborted());
        match select(future, aborted).await {
            Either::Left((output, _)) => {
                self.throw_if_aborted()?;
                Ok(output)
            }
            Either::Right(((), _)) => Err(QueryError::Aborted {
                reason: self.reason().unwrap_or(AbortReason::Cancelled),
            }),
        }
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .field("reason", &self.reason())
            .finish()
    }
}
