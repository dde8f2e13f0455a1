//! A keyed work queue with rate-limited retries and a pool of workers.
//!
//! Keys are plain strings (usually `namespace/name`). The queue guarantees that:
//!
//! - a key that is already waiting in the queue is not queued again, so bursts
//!   of events for the same object collapse into a single unit of work;
//! - a key is never processed by more than one worker at a time. A key that is
//!   re-added while it is being processed is queued again once the worker
//!   finishes with it;
//! - a key whose processing fails is requeued after a delay chosen by the
//!   [`RateLimiter`], and its backoff is reset once it is processed
//!   successfully.
//!
//! The queue knows nothing about what processing means. Each pipeline provides
//! a [`Process`] implementation and hands it to [`Queue::run`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
mod rate_limit;


pub use self::{metrics::QueueMetrics, rate_limit::RateLimiter};

use self::metrics::Outcome;
use ahash::AHashSet as HashSet;
use futures::FutureExt;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Notify, time};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Processes a single key taken from a [`Queue`].
#[async_trait::async_trait]
pub trait Process: Send + Sync + 'static {
    type Error: std::fmt::Display + Send + 'static;

    async fn process(&self, key: &str) -> Result<(), Self::Error>;
}

/// The only capability a pipeline exposes to other pipelines.
pub trait Enqueue: Send + Sync {
    fn enqueue_key(&self, key: &str);
}

#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    ready: Notify,
    limiter: Mutex<RateLimiter>,
    metrics: QueueMetrics,
    next_id: AtomicU64,
}

#[derive(Default)]
struct State {
    /// Keys ready to be handed to a worker, in order.
    queue: VecDeque<String>,

    /// Keys that need processing, whether queued or waiting on a worker.
    dirty: HashSet<String>,

    /// Keys currently held by a worker.
    processing: HashSet<String>,

    shutting_down: bool,
}

// === impl Queue ===

impl Queue {
    pub fn new(name: impl ToString, limiter: RateLimiter, metrics: QueueMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: Mutex::new(State::default()),
                ready: Notify::new(),
                limiter: Mutex::new(limiter),
                metrics,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The number of keys waiting to be handed to a worker.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&self, key: String) {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return;
        }
        self.inner.metrics.add(&self.inner.name);

        if !state.dirty.insert(key.clone()) {
            return;
        }
        // Picked up again by `done` once the current worker finishes.
        if state.processing.contains(&key) {
            return;
        }

        state.queue.push_back(key);
        self.inner
            .metrics
            .set_depth(&self.inner.name, state.queue.len());
        drop(state);
        self.inner.ready.notify_one();
    }

    pub fn add_after(&self, key: String, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Requeues `key` after its backoff delay.
    pub fn add_rate_limited(&self, key: String) {
        let delay = self.inner.limiter.lock().when(&key);
        self.inner.metrics.retry(&self.inner.name);
        self.add_after(key, delay);
    }

    /// Resets the backoff of `key`.
    pub fn forget(&self, key: &str) {
        self.inner.limiter.lock().forget(key);
    }

    pub fn requeues(&self, key: &str) -> u32 {
        self.inner.limiter.lock().failures(key)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    ///
    /// The returned key must be released with [`Queue::done`].
    pub async fn next(&self) -> Option<String> {
        loop {
            // Created before the state is checked so that a shutdown between
            // the check and the wait is not missed.
            let ready = self.inner.ready.notified();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.inner
                        .metrics
                        .set_depth(&self.inner.name, state.queue.len());
                    return Some(key);
                }
            }
            ready.await;
        }
    }

    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            self.inner
                .metrics
                .set_depth(&self.inner.name, state.queue.len());
            drop(state);
            self.inner.ready.notify_one();
        }
    }

    /// Stops handing out keys. Keys added afterwards are ignored.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.ready.notify_waiters();
    }

    /// Runs `workers` workers until `shutdown` completes.
    ///
    /// Each key is processed within its own span, identified by a correlation
    /// id, and is abandoned (and retried) if it takes longer than
    /// `item_timeout`. Once `shutdown` completes no new keys are handed out and
    /// this returns when the in-flight keys are finished.
    pub async fn run<P, S>(self, process: Arc<P>, workers: usize, item_timeout: Duration, shutdown: S)
    where
        P: Process,
        S: Future<Output = ()>,
    {
        let workers = workers.max(1);
        info!(queue = %self.inner.name, workers, "Starting workers");
        let tasks = (0..workers)
            .map(|_| tokio::spawn(self.clone().worker(process.clone(), item_timeout)))
            .collect::<Vec<_>>();

        shutdown.await;
        debug!(queue = %self.inner.name, "Shutting down");
        self.shut_down();

        for res in futures::future::join_all(tasks).await {
            if let Err(error) = res {
                warn!(queue = %self.inner.name, %error, "Worker failed");
            }
        }
        info!(queue = %self.inner.name, "Workers stopped");
    }

    async fn worker<P: Process>(self, process: Arc<P>, item_timeout: Duration) {
        while let Some(key) = self.next().await {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let span = info_span!("item", queue = %self.inner.name, %key, id);
            self.process_key(&*process, &key, item_timeout)
                .instrument(span)
                .await;
            self.done(&key);
        }
    }

    async fn process_key<P: Process>(&self, process: &P, key: &str, item_timeout: Duration) {
        let start = time::Instant::now();
        let res = time::timeout(
            item_timeout,
            AssertUnwindSafe(process.process(key)).catch_unwind(),
        )
        .await;
        let elapsed = start.elapsed();

        let outcome = match res {
            Ok(Ok(Ok(()))) => {
                debug!(?elapsed, "Processed");
                self.forget(key);
                Outcome::Ok
            }
            Ok(Ok(Err(error))) => {
                warn!(%error, requeues = self.requeues(key), "Failed to process; retrying");
                self.add_rate_limited(key.to_string());
                Outcome::Error
            }
            // The worker survives so that the key is released and retried.
            Ok(Err(_)) => {
                error!(requeues = self.requeues(key), "Processing panicked; retrying");
                self.add_rate_limited(key.to_string());
                Outcome::Panic
            }
            Err(_) => {
                warn!(timeout = ?item_timeout, "Timed out processing; retrying");
                self.add_rate_limited(key.to_string());
                Outcome::Timeout
            }
        };
        self.inner
            .metrics
            .processed(&self.inner.name, outcome, elapsed);
    }
}

impl Enqueue for Queue {
    fn enqueue_key(&self, key: &str) {
        self.add(key.to_string());
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .finish()
    }
}
