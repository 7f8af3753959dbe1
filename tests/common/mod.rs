//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use query_cache::{
    AbortReason, AbortSignal, FetchContext, FetchOutcome, QueryError, QueryFn, QueryKey, Tracer,
};
use tokio::sync::watch;

/// Work function factory whose invocations block until released.
///
/// Invocation `n` resolves to `"data-{n}"` once [`Harness::release`] was called
/// with a value of at least `n`. Waiting is abort-aware.
pub struct Harness {
    calls: Arc<AtomicU64>,
    gate: watch::Sender<u64>,
    signals: Arc<Mutex<Vec<(u64, AbortSignal)>>>,
}

impl Harness {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(0);
        Self {
            calls: Arc::new(AtomicU64::new(0)),
            gate,
            signals: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Work function observing its abort signal while blocked.
    pub fn work(&self) -> impl QueryFn<String> + Clone {
        self.build_work(true)
    }

    /// Work function that never checks its abort signal.
    pub fn stubborn_work(&self) -> impl QueryFn<String> + Clone {
        self.build_work(false)
    }

    fn build_work(&self, observe_abort: bool) -> impl QueryFn<String> + Clone {
        let calls = self.calls.clone();
        let gate = self.gate.subscribe();
        let signals = self.signals.clone();
        move |ctx: FetchContext| {
            let calls = calls.clone();
            let mut gate = gate.clone();
            let signals = signals.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let n = ctx.invocation();
                signals.lock().push((n, ctx.signal().clone()));

                let released = async {
                    let _ = gate.wait_for(|released| *released >= n).await;
                };
                if observe_abort {
                    ctx.signal().run(released).await?;
                } else {
                    released.await;
                }
                Ok::<_, QueryError>(format!("data-{}", n))
            }
        }
    }

    /// Let every invocation up to `n` finish.
    pub fn release(&self, n: u64) {
        self.gate.send_replace(n);
    }

    /// Number of times a work function actually started running.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Signal handed to invocation `n`, once it has started running.
    pub fn signal(&self, n: u64) -> Option<AbortSignal> {
        self.signals
            .lock()
            .iter()
            .find(|(invocation, _)| *invocation == n)
            .map(|(_, signal)| signal.clone())
    }
}

/// Yield to the runtime until `condition` holds.
pub async fn settle_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Created(QueryKey),
    Removed(QueryKey),
    Start(u64),
    Deduplicated(u64),
    Superseded(u64, u64),
    Paused(u64),
    Settled(u64, FetchOutcome),
    Discarded(u64),
    Cancelled(u64, AbortReason),
}

/// Tracer that records every event.
#[derive(Clone, Default)]
pub struct RecordingTracer {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn contains(&self, event: &Event) -> bool {
        self.events.lock().contains(event)
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl Tracer for RecordingTracer {
    fn on_query_created(&self, key: &QueryKey) {
        self.push(Event::Created(key.clone()));
    }

    fn on_query_removed(&self, key: &QueryKey) {
        self.push(Event::Removed(key.clone()));
    }

    fn on_fetch_start(&self, _key: &QueryKey, invocation: u64) {
        self.push(Event::Start(invocation));
    }

    fn on_fetch_deduplicated(&self, _key: &QueryKey, invocation: u64) {
        self.push(Event::Deduplicated(invocation));
    }

    fn on_fetch_superseded(&self, _key: &QueryKey, superseded: u64, replacement: u64) {
        self.push(Event::Superseded(superseded, replacement));
    }

    fn on_fetch_paused(&self, _key: &QueryKey, invocation: u64) {
        self.push(Event::Paused(invocation));
    }

    fn on_fetch_settled(&self, _key: &QueryKey, invocation: u64, outcome: &FetchOutcome) {
        self.push(Event::Settled(invocation, outcome.clone()));
    }

    fn on_fetch_discarded(&self, _key: &QueryKey, invocation: u64) {
        self.push(Event::Discarded(invocation));
    }

    fn on_fetch_cancelled(&self, _key: &QueryKey, invocation: u64, reason: &AbortReason) {
        self.push(Event::Cancelled(invocation, reason.clone()));
    }
}

/// Abort reason carried by `error`, if it is a cancellation.
pub fn abort_reason(error: &QueryError) -> Option<AbortReason> {
    match error {
        QueryError::Aborted { reason } => Some(reason.clone()),
        _ => None,
    }
}
