//! A single fetch attempt and the callers waiting on it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::query::QueryStatus;
use crate::signal::{AbortReason, AbortSignal};
use crate::QueryError;

/// Outcome delivered to every waiter of an attempt.
pub(crate) type FetchResult<T> = Result<Arc<T>, QueryError>;

/// One in-flight invocation of a work function.
///
/// A slot is identified by its invocation number, which is unique per query.
/// Waiters are kept in arrival order; when a slot is replaced its waiters move
/// to the front of the replacement.
pub(crate) struct FetchSlot<T> {
    invocation: u64,
    signal: AbortSignal,
    waiters: Vec<oneshot::Sender<FetchResult<T>>>,
    /// Status to restore if the attempt chain ends in a cancellation.
    revert_status: QueryStatus,
}

impl<T> FetchSlot<T> {
    pub(crate) fn new(invocation: u64, revert_status: QueryStatus) -> Self {
        Self {
            invocation,
            signal: AbortSignal::new(),
            waiters: Vec::new(),
            revert_status,
        }
    }

    pub(crate) fn invocation(&self) -> u64 {
        self.invocation
    }

    pub(crate) fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub(crate) fn revert_status(&self) -> QueryStatus {
        self.revert_status
    }

    /// Register a new waiter and return its handle.
    pub(crate) fn push_waiter(&mut self) -> FetchHandle<T> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.push(sender);
        FetchHandle { receiver }
    }

    /// Move every waiter of `superseded` into this slot, ahead of existing waiters.
    pub(crate) fn adopt_waiters(&mut self, superseded: FetchSlot<T>) {
        let mut waiters = superseded.waiters;
        waiters.append(&mut self.waiters);
        self.waiters = waiters;
    }

    pub(crate) fn abort(&self, reason: AbortReason) -> bool {
        self.signal.abort(reason)
    }

    /// Deliver `result` to every waiter. Dropped handles are skipped.
    pub(crate) fn resolve(self, result: FetchResult<T>) {
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Future returned by [`Query::fetch`](crate::Query::fetch).
///
/// Every caller joined to the same attempt observes the same outcome. A
/// handle whose attempt is replaced follows the replacement transparently.
/// Dropping a handle does not cancel the attempt.
#[must_use = "a fetch handle does nothing unless awaited; the fetch itself keeps running"]
pub struct FetchHandle<T> {
    receiver: oneshot::Receiver<FetchResult<T>>,
}

impl<T> FetchHandle<T> {
    /// A handle that is already resolved with `value`.
    pub(crate) fn ready(value: Arc<T>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Ok(value));
        FetchHandle { receiver }
    }
}

impl<T> Future for FetchHandle<T> {
    type Output = Result<Arc<T>, QueryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // the query was dropped with this attempt still in flight
            Poll::Ready(Err(_)) => Poll::Ready(Err(QueryError::Aborted {
                reason: AbortReason::Disposed,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for FetchHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_fans_out_to_every_waiter() {
        let mut slot = FetchSlot::<u32>::new(1, QueryStatus::Idle);
        let first = slot.push_waiter();
        let second = slot.push_waiter();

        slot.resolve(Ok(Arc::new(5)));

        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert_eq!(*first, 5);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_adopted_waiters_come_first() {
        let mut old = FetchSlot::<u32>::new(1, QueryStatus::Pending);
        let a = old.push_waiter();
        let b = old.push_waiter();

        let mut new = FetchSlot::<u32>::new(2, old.revert_status());
        new.adopt_waiters(old);
        let c = new.push_waiter();
        assert_eq!(new.waiters.len(), 3);

        new.resolve(Ok(Arc::new(2)));
        for handle in [a, b, c] {
            assert_eq!(*handle.await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_dropped_slot_reports_disposed() {
        let mut slot = FetchSlot::<u32>::new(1, QueryStatus::Idle);
        let handle = slot.push_waiter();
        drop(slot);

        match handle.await {
            Err(QueryError::Aborted { reason }) => assert_eq!(reason, AbortReason::Disposed),
            other => panic!("expected Aborted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_skips_dropped_handles() {
        let mut slot = FetchSlot::<u32>::new(1, QueryStatus::Idle);
        drop(slot.push_waiter());
        let kept = slot.push_waiter();

        slot.resolve(Ok(Arc::new(9)));
        assert_eq!(*kept.await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_ready_handle() {
        let handle = FetchHandle::ready(Arc::new("cached"));
        assert_eq!(*handle.await.unwrap(), "cached");
    }
}
