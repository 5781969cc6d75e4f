//! Application-facing services: the top stage of a pipeline.
//!
//! A service decides how a decoded item reaches application code:
//! synchronously ([`Direct`]), routed by type ([`Router`]), or offloaded
//! to a worker thread ([`Async`]). [`Statistics`], [`Filter`] and
//! [`Retry`] are compositional wrappers around any of them.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::message::{TypeId, TypedPayload};

/// Queued messages older than this are logged when finally processed.
const AGED_MESSAGE_WARN: Duration = Duration::from_secs(1);

/// Routing / filtering / retry wrapper in front of application handlers.
///
/// `fallback` is the handler supplied to the pipeline's receive loop;
/// services either invoke it, route around it, or defer it.
pub trait Service<M> {
    /// Handle one item. Errors surface resource exhaustion
    /// ([`Error::Overflow`]) and misuse; they never mean the handler
    /// itself failed.
    fn handle(&mut self, msg: M, fallback: &mut dyn FnMut(M)) -> Result<()>;
}

/// Call the handler synchronously on the pipeline thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct Direct;

impl<M> Service<M> for Direct {
    fn handle(&mut self, msg: M, fallback: &mut dyn FnMut(M)) -> Result<()> {
        fallback(msg);
        Ok(())
    }
}

type RouteHandler = Box<dyn FnMut(TypedPayload) + Send>;

/// Dispatch typed payloads by type id, falling back to the pipeline
/// handler for unregistered types.
#[derive(Default)]
pub struct Router {
    routes: HashMap<u32, RouteHandler>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `type_id` payloads to `handler`.
    pub fn register(&mut self, type_id: TypeId, handler: impl FnMut(TypedPayload) + Send + 'static) {
        self.routes.insert(type_id.0, Box::new(handler));
    }

    /// Remove a route.
    pub fn unregister(&mut self, type_id: TypeId) {
        self.routes.remove(&type_id.0);
    }

    /// Drop every route.
    pub fn clear(&mut self) {
        self.routes.clear();
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Service<TypedPayload> for Router {
    fn handle(&mut self, msg: TypedPayload, fallback: &mut dyn FnMut(TypedPayload)) -> Result<()> {
        match self.routes.get_mut(&msg.type_id.0) {
            Some(route) => route(msg),
            None => fallback(msg),
        }
        Ok(())
    }
}

struct QueuedMessage<M> {
    msg: M,
    enqueued_at: Instant,
}

/// Offload handling to one worker thread behind a bounded queue.
///
/// The worker invokes the callback given at construction; a borrowed loop
/// handler cannot cross the thread boundary, so the pipeline's fallback is
/// not used by this service. The worker catches panics from the callback,
/// logs them and keeps going; messages queued for more than a second are
/// logged as aged. [`Async::stop`] processes the backlog, then joins.
pub struct Async<M: Send + 'static> {
    tx: Option<kanal::Sender<QueuedMessage<M>>>,
    worker: Option<std::thread::JoinHandle<()>>,
    capacity: usize,
}

impl<M: Send + 'static> Async<M> {
    /// Spawn the worker with a queue of `capacity` entries.
    pub fn new(capacity: usize, callback: impl FnMut(M) + Send + 'static) -> Self {
        let (tx, rx) = kanal::bounded::<QueuedMessage<M>>(capacity);
        let worker = std::thread::Builder::new()
            .name("conduit-async-svc".to_string())
            .spawn(move || worker_loop(rx, callback))
            .ok();
        if worker.is_none() {
            tracing::error!("async service worker failed to spawn");
        }
        Self {
            tx: Some(tx),
            worker,
            capacity,
        }
    }

    /// Messages currently queued.
    pub fn queue_len(&self) -> usize {
        self.tx.as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the queue is full.
    pub fn is_full(&self) -> bool {
        self.queue_len() >= self.capacity
    }

    /// Stop accepting work, drain the backlog and join the worker.
    pub fn stop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("async service worker panicked");
            }
        }
    }
}

impl<M: Send + 'static> Drop for Async<M> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<M>(rx: kanal::Receiver<QueuedMessage<M>>, mut callback: impl FnMut(M)) {
    // recv drains remaining entries before reporting the channel closed,
    // which is exactly the stop semantics.
    while let Ok(entry) = rx.recv() {
        let age = entry.enqueued_at.elapsed();
        if age > AGED_MESSAGE_WARN {
            tracing::warn!(age_ms = age.as_millis() as u64, "processing aged message");
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| callback(entry.msg)));
        if outcome.is_err() {
            tracing::error!("async handler panicked; worker continues");
        }
    }
}

impl<M: Send + 'static> Service<M> for Async<M> {
    fn handle(&mut self, msg: M, _fallback: &mut dyn FnMut(M)) -> Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(Error::Invalid("async service stopped"));
        };
        match tx.try_send(QueuedMessage {
            msg,
            enqueued_at: Instant::now(),
        }) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Overflow("async queue full")),
            Err(_) => Err(Error::Invalid("async worker gone")),
        }
    }
}

/// Counters recorded by [`Statistics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Items entering the wrapped service.
    pub total: u64,
    /// Items the wrapped service accepted.
    pub handled: u64,
    /// Items the wrapped service refused.
    pub errors: u64,
    /// Total handling time, microseconds.
    pub total_micros: u64,
    /// Slowest single item, microseconds.
    pub max_micros: u64,
}

impl ServiceStats {
    /// Mean handling time in microseconds.
    pub fn avg_micros(&self) -> u64 {
        if self.handled == 0 {
            0
        } else {
            self.total_micros / self.handled
        }
    }
}

/// Wrap a service with throughput and latency counters.
pub struct Statistics<S> {
    base: S,
    stats: ServiceStats,
}

impl<S> Statistics<S> {
    /// Wrap `base`.
    pub fn new(base: S) -> Self {
        Self {
            base,
            stats: ServiceStats::default(),
        }
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> ServiceStats {
        self.stats
    }

    /// Zero the counters.
    pub fn reset_stats(&mut self) {
        self.stats = ServiceStats::default();
    }

    /// The wrapped service.
    pub fn base(&self) -> &S {
        &self.base
    }
}

impl<M, S: Service<M>> Service<M> for Statistics<S> {
    fn handle(&mut self, msg: M, fallback: &mut dyn FnMut(M)) -> Result<()> {
        self.stats.total += 1;
        let start = Instant::now();
        let result = self.base.handle(msg, fallback);
        let micros = start.elapsed().as_micros() as u64;

        match &result {
            Ok(()) => {
                self.stats.handled += 1;
                self.stats.total_micros += micros;
                self.stats.max_micros = self.stats.max_micros.max(micros);
            }
            Err(err) => {
                self.stats.errors += 1;
                tracing::debug!(%err, "wrapped service refused message");
            }
        }
        result
    }
}

/// Wrap a service with an accept/reject predicate.
///
/// Rejected items are counted and dropped; the wrapped service never sees
/// them.
pub struct Filter<S, P> {
    base: S,
    predicate: P,
    accepted: u64,
    rejected: u64,
}

impl<S, P> Filter<S, P> {
    /// Wrap `base` behind `predicate`.
    pub fn new(base: S, predicate: P) -> Self {
        Self {
            base,
            predicate,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Items that passed the predicate.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Items the predicate dropped.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// The wrapped service.
    pub fn base(&self) -> &S {
        &self.base
    }
}

impl<M, S, P> Service<M> for Filter<S, P>
where
    S: Service<M>,
    P: FnMut(&M) -> bool,
{
    fn handle(&mut self, msg: M, fallback: &mut dyn FnMut(M)) -> Result<()> {
        if (self.predicate)(&msg) {
            self.accepted += 1;
            self.base.handle(msg, fallback)
        } else {
            self.rejected += 1;
            Ok(())
        }
    }
}

/// Retry a refusing service up to an attempt cap, with optional backoff.
///
/// Useful over [`Async`]: a full queue surfaces as [`Error::Overflow`],
/// and a bounded retry absorbs short bursts.
pub struct Retry<S> {
    base: S,
    max_attempts: u32,
    backoff: Duration,
}

impl<S> Retry<S> {
    /// Wrap `base` with an attempt cap.
    pub fn new(base: S, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts: max_attempts.max(1),
            backoff: Duration::ZERO,
        }
    }

    /// Sleep between attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// The wrapped service.
    pub fn base(&self) -> &S {
        &self.base
    }
}

impl<M: Clone, S: Service<M>> Service<M> for Retry<S> {
    fn handle(&mut self, msg: M, fallback: &mut dyn FnMut(M)) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.base.handle(msg.clone(), fallback) {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= self.max_attempts => {
                    tracing::warn!(%err, attempts = attempt, "retry attempts exhausted");
                    return Err(err);
                }
                Err(_) => {
                    attempt += 1;
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                }
            }
        }
    }
}
