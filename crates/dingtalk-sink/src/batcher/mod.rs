use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{
    DEFAULT_BATCH_SIZE_LIMIT, DEFAULT_PERIOD, DEFAULT_QUEUE_LIMIT, DEFAULT_SHUTDOWN_TIMEOUT,
};
use crate::event::{Level, LogEvent};
use crate::sink::BatchSink;

/// Log a drop warning on the first overflow and then every this many drops.
const DROP_WARN_EVERY: u64 = 1000;

/// Slack the caller gives the worker past `shutdown_timeout` before aborting it.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Shortest accepted flush period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct BatchingOptions {
    /// Most events handed to the sink per flush.
    pub batch_size_limit: usize,
    /// Interval between flush ticks. Raised to 1 ms if shorter.
    pub period: Duration,
    /// Bound on queued events. When full, new events are rejected.
    pub queue_limit: usize,
    /// Flush out of cycle when an event lands in an empty queue.
    pub eagerly_emit_first: bool,
    /// Upper bound on the final drain during shutdown.
    pub shutdown_timeout: Duration,
    /// Events below this level are ignored at enqueue.
    pub minimum_level: Level,
}

impl Default for BatchingOptions {
    fn default() -> Self {
        Self {
            batch_size_limit: DEFAULT_BATCH_SIZE_LIMIT,
            period: DEFAULT_PERIOD,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            eagerly_emit_first: false,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            minimum_level: Level::MINIMUM,
        }
    }
}

#[derive(Default)]
struct Counters {
    dropped: AtomicU64,
    failed_batches: AtomicU64,
    abandoned: AtomicU64,
    /// Size of the batch currently inside `emit_batch`.
    in_flight: AtomicU64,
    eager: Notify,
}

impl Counters {
    fn record_drop(&self, closed: bool) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if closed {
            debug!(dropped, "sink is shut down, dropping event");
        } else if dropped == 1 || dropped % DROP_WARN_EVERY == 0 {
            warn!(dropped, "log queue is full, dropping event");
        }
    }

    /// Count the in-flight batch plus `queued` events as lost to the shutdown timeout.
    fn abandon(&self, queued: usize) -> u64 {
        let lost = self.in_flight.swap(0, Ordering::Relaxed) + queued as u64;
        self.abandoned.fetch_add(lost, Ordering::Relaxed);
        lost
    }
}

/// Counter values captured after the final drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownStats {
    pub dropped: u64,
    pub failed_batches: u64,
    /// Events still unsent when the final flush ran out of time.
    pub abandoned: u64,
}

/// Cloneable producer handle. `enqueue` never blocks and never fails.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<LogEvent>,
    counters: Arc<Counters>,
    minimum_level: Level,
    eagerly_emit_first: bool,
}

impl EventSender {
    /// Queue an event for the next flush. If the queue is at its limit the
    /// event is dropped and counted.
    pub fn enqueue(&self, event: LogEvent) {
        if event.level < self.minimum_level {
            return;
        }

        let was_empty = self.tx.capacity() == self.tx.max_capacity();
        match self.tx.try_send(event) {
            Ok(()) => {
                if self.eagerly_emit_first && was_empty {
                    self.counters.eager.notify_one();
                }
            }
            Err(TrySendError::Full(_)) => self.counters.record_drop(false),
            Err(TrySendError::Closed(_)) => self.counters.record_drop(true),
        }
    }

    /// Events waiting for a flush.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Periodic batching front for a [`BatchSink`].
///
/// One background task per instance owns the queue receiver and the sink.
/// Flushes run inline in that task, so at most one batch is in flight and
/// batches reach the sink in enqueue order.
pub struct BatchingSink {
    sender: EventSender,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl BatchingSink {
    /// Start the flush loop. Must be called from within a Tokio runtime.
    pub fn spawn<S: BatchSink>(sink: S, mut options: BatchingOptions) -> Self {
        options.period = options.period.max(MIN_PERIOD);
        let (tx, rx) = mpsc::channel(options.queue_limit.max(1));
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let sender = EventSender {
            tx,
            counters: Arc::clone(&counters),
            minimum_level: options.minimum_level,
            eagerly_emit_first: options.eagerly_emit_first,
        };
        let shutdown_timeout = options.shutdown_timeout;

        let worker = Worker {
            sink,
            rx,
            batch_size_limit: options.batch_size_limit.max(1),
            options,
            counters,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            sender,
            cancel,
            task: Some(task),
            shutdown_timeout,
        }
    }

    pub fn enqueue(&self, event: LogEvent) {
        self.sender.enqueue(event);
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn queued(&self) -> usize {
        self.sender.queued()
    }

    /// Events rejected because the queue was full or the sink was shut down.
    pub fn dropped(&self) -> u64 {
        self.sender.counters.dropped.load(Ordering::Relaxed)
    }

    /// Batches the sink failed to deliver. Those events are not retried.
    pub fn failed_batches(&self) -> u64 {
        self.sender.counters.failed_batches.load(Ordering::Relaxed)
    }

    /// Events lost because the final flush exceeded `shutdown_timeout`.
    pub fn abandoned(&self) -> u64 {
        self.sender.counters.abandoned.load(Ordering::Relaxed)
    }

    /// Stop ticking, drain what is queued, and release the sink.
    ///
    /// The worker gives up on its final flush after `shutdown_timeout`. If it
    /// is still running `SHUTDOWN_GRACE` later (stuck in a tick's delivery),
    /// it is aborted, which drops the sink all the same.
    pub async fn shutdown(mut self) -> ShutdownStats {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            self.join(task).await;
        }
        ShutdownStats {
            dropped: self.dropped(),
            failed_batches: self.failed_batches(),
            abandoned: self.abandoned(),
        }
    }

    async fn join(&self, mut task: JoinHandle<()>) {
        let limit = self.shutdown_timeout + SHUTDOWN_GRACE;
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(())) => debug!("batching sink shut down"),
            Ok(Err(e)) => error!(error = %e, "batching task panicked"),
            Err(_) => {
                let queued = self.queued();
                task.abort();
                let _ = task.await;
                let abandoned = self.sender.counters.abandon(queued);
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    abandoned,
                    "batching task exceeded shutdown timeout, aborted it"
                );
            }
        }
    }
}

impl Drop for BatchingSink {
    /// Without an explicit `shutdown`, the task still drains in the
    /// background, bounded by `shutdown_timeout`.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker<S> {
    sink: S,
    rx: mpsc::Receiver<LogEvent>,
    batch_size_limit: usize,
    options: BatchingOptions,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl<S: BatchSink> Worker<S> {
    async fn run(mut self) {
        // First tick one full period after start.
        let mut interval =
            tokio::time::interval_at(Instant::now() + self.options.period, self.options.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let counters = Arc::clone(&self.counters);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let batch = self.drain();
                    if batch.is_empty() {
                        self.sink.on_empty_batch().await;
                    } else {
                        self.emit(batch).await;
                    }
                }
                _ = counters.eager.notified(), if self.options.eagerly_emit_first => {
                    let batch = self.drain();
                    if !batch.is_empty() {
                        self.emit(batch).await;
                    }
                }
            }
        }

        self.drain_on_shutdown().await;
    }

    /// Take up to `batch_size_limit` events, oldest first.
    fn drain(&mut self) -> Vec<LogEvent> {
        let mut batch = Vec::with_capacity(self.batch_size_limit.min(self.rx.len()));
        while batch.len() < self.batch_size_limit {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        batch
    }

    async fn emit(&self, batch: Vec<LogEvent>) {
        let count = batch.len();
        self.counters.in_flight.store(count as u64, Ordering::Relaxed);
        let result = self.sink.emit_batch(batch).await;
        self.counters.in_flight.store(0, Ordering::Relaxed);
        match result {
            Ok(()) => debug!(count, "emitted batch"),
            Err(e) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, count, "failed to emit batch");
            }
        }
    }

    async fn drain_on_shutdown(mut self) {
        self.rx.close();
        let timeout = self.options.shutdown_timeout;

        let drained = tokio::time::timeout(timeout, async {
            loop {
                let batch = self.drain();
                if batch.is_empty() {
                    break;
                }
                self.emit(batch).await;
            }
        })
        .await;

        if drained.is_err() {
            let abandoned = self.counters.abandon(self.rx.len());
            warn!(abandoned, "final flush exceeded shutdown timeout");
        }
        // `self.sink` drops here, releasing its connection.
    }
}
