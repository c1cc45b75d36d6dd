//! Concurrency Limiter - FIFO admission queue for sandbox runs
//!
//! A limiter bounds how many runs execute at once. One dispatcher task owns
//! the queue and the running counter; callers and finishing tasks talk to it
//! over channels, so nothing here takes a lock and the next queued task is
//! always started from a fresh dispatcher turn rather than from inside the
//! completion of the previous one.
//!
//! # Performance-First Design:
//! - One dispatcher per queue, no shared mutable state
//! - Queued tasks whose caller already gave up are skipped, not run
//! - A panicking task settles as [`QueueError::TaskPanicked`] and frees its slot

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::QueueError;

/// Default number of simultaneous runs.
pub const DEFAULT_CONCURRENCY: usize = 5;

type Task<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Lifecycle hooks for queued tasks. Every hook defaults to a no-op.
pub trait TaskObserver: Send + Sync {
    fn on_start(&self, _queue: &str, _task_id: u64) {}
    fn on_complete(&self, _queue: &str, _task_id: u64, _elapsed: Duration) {}
    fn on_error(&self, _queue: &str, _task_id: u64, _error: &QueueError) {}
}

struct NoopObserver;

impl TaskObserver for NoopObserver {}

/// How a queue is built.
#[derive(Clone)]
pub struct QueueOptions {
    pub concurrency: usize,
    pub observer: Arc<dyn TaskObserver>,
}

impl QueueOptions {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    pub fn observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observer = observer;
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            observer: Arc::new(NoopObserver),
        }
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
    pub concurrency: usize,
}

struct Queued<T> {
    id: u64,
    task: Task<T>,
    responder: oneshot::Sender<Result<T, QueueError>>,
}

enum Command<T> {
    Enqueue(Queued<T>),
    Clear(oneshot::Sender<usize>),
    Status(oneshot::Sender<QueueStatus>),
}

/// Handle to a FIFO queue that runs at most `concurrency` tasks at once.
///
/// Cloning is cheap; all clones feed the same dispatcher.
pub struct ConcurrencyLimiter<T> {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command<T>>,
    next_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl<T> Clone for ConcurrencyLimiter<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            commands: self.commands.clone(),
            next_id: self.next_id.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: Send + 'static> ConcurrencyLimiter<T> {
    /// Start a queue. Must be called within a tokio runtime.
    pub fn new(name: impl Into<String>, options: QueueOptions) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (commands, inbox) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher {
            name: name.clone(),
            concurrency: options.concurrency.max(1),
            observer: options.observer,
            queue: VecDeque::new(),
            running: 0,
            done_tx,
        };
        tokio::spawn(dispatcher.run(inbox, done_rx, shutdown.clone()));
        debug!(queue = %name, concurrency = options.concurrency.max(1), "queue started");
        Self {
            name,
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task and wait for its outcome.
    pub async fn enqueue<F>(&self, task: F) -> Result<T, QueueError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, outcome) = oneshot::channel();
        self.commands
            .send(Command::Enqueue(Queued {
                id,
                task: Box::pin(task),
                responder,
            }))
            .map_err(|_| self.closed())?;
        outcome.await.map_err(|_| self.closed())?
    }

    /// Reject every task that has not started. Returns how many were rejected.
    pub async fn clear(&self) -> usize {
        let (reply, cleared) = oneshot::channel();
        if self.commands.send(Command::Clear(reply)).is_err() {
            return 0;
        }
        cleared.await.unwrap_or(0)
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let (reply, status) = oneshot::channel();
        self.commands
            .send(Command::Status(reply))
            .map_err(|_| self.closed())?;
        status.await.map_err(|_| self.closed())
    }

    /// Stop dispatching. Queued tasks are rejected; running tasks finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn closed(&self) -> QueueError {
        QueueError::Closed(self.name.to_string())
    }
}

struct Dispatcher<T> {
    name: Arc<str>,
    concurrency: usize,
    observer: Arc<dyn TaskObserver>,
    queue: VecDeque<Queued<T>>,
    running: usize,
    done_tx: mpsc::UnboundedSender<()>,
}

impl<T: Send + 'static> Dispatcher<T> {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Command<T>>,
        mut done: mpsc::UnboundedReceiver<()>,
        shutdown: CancellationToken,
    ) {
        let mut accepting = true;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    let name = self.name.to_string();
                    let rejected = self.reject_all(|| QueueError::Closed(name.clone()));
                    debug!(queue = %self.name, rejected, "queue shut down");
                    return;
                }
                Some(()) = done.recv() => {
                    self.running = self.running.saturating_sub(1);
                }
                command = inbox.recv(), if accepting => match command {
                    Some(Command::Enqueue(queued)) => {
                        trace!(queue = %self.name, task_id = queued.id, "task queued");
                        self.queue.push_back(queued);
                    }
                    Some(Command::Clear(reply)) => {
                        let rejected = self.reject_all(|| QueueError::Cancelled);
                        debug!(queue = %self.name, rejected, "queue cleared");
                        let _ = reply.send(rejected);
                    }
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(QueueStatus {
                            queued: self.queue.len(),
                            running: self.running,
                            concurrency: self.concurrency,
                        });
                    }
                    // Every handle is gone; finish what was already admitted.
                    None => accepting = false,
                },
            }
            self.dispatch();
            if !accepting && self.queue.is_empty() && self.running == 0 {
                return;
            }
        }
    }

    fn dispatch(&mut self) {
        while self.running < self.concurrency {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            if queued.responder.is_closed() {
                trace!(queue = %self.name, task_id = queued.id, "skipping abandoned task");
                continue;
            }
            self.running += 1;
            self.observer.on_start(&self.name, queued.id);
            trace!(queue = %self.name, task_id = queued.id, running = self.running, "task started");
            tokio::spawn(supervise(
                self.name.clone(),
                self.observer.clone(),
                queued,
                self.done_tx.clone(),
            ));
        }
    }

    fn reject_all(&mut self, error: impl Fn() -> QueueError) -> usize {
        let rejected = self.queue.len();
        for queued in self.queue.drain(..) {
            let _ = queued.responder.send(Err(error()));
        }
        rejected
    }
}

async fn supervise<T: Send + 'static>(
    name: Arc<str>,
    observer: Arc<dyn TaskObserver>,
    queued: Queued<T>,
    done: mpsc::UnboundedSender<()>,
) {
    let started = Instant::now();
    let outcome = tokio::spawn(queued.task)
        .await
        .map_err(|e| match e.try_into_panic() {
            Ok(payload) => QueueError::TaskPanicked(panic_message(payload)),
            Err(e) => QueueError::TaskPanicked(e.to_string()),
        });
    match &outcome {
        Ok(_) => {
            let elapsed = started.elapsed();
            trace!(queue = %name, task_id = queued.id, elapsed_ms = elapsed.as_millis() as u64, "task completed");
            observer.on_complete(&name, queued.id, elapsed);
        }
        Err(error) => {
            warn!(queue = %name, task_id = queued.id, error = %error, "task failed");
            observer.on_error(&name, queued.id, error);
        }
    }
    let _ = queued.responder.send(outcome);
    let _ = done.send(());
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Named queues created at startup and shared by name.
#[derive(Default)]
pub struct QueueRegistry {
    queues: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the queue called `name`, creating it with `options` if needed.
    /// A name is bound to one task type for the registry's lifetime.
    pub fn get_or_create<T: Send + 'static>(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<ConcurrencyLimiter<T>, QueueError> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = queues.get(name) {
            return existing
                .downcast_ref::<ConcurrencyLimiter<T>>()
                .cloned()
                .ok_or_else(|| QueueError::TypeMismatch {
                    name: name.to_string(),
                });
        }
        let limiter = ConcurrencyLimiter::<T>::new(name, options);
        queues.insert(name.to_string(), Box::new(limiter.clone()));
        Ok(limiter)
    }

    pub fn len(&self) -> usize {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_enqueue_returns_task_output() {
        let queue = ConcurrencyLimiter::new("test", QueueOptions::default());
        assert_eq!(queue.enqueue(async { 41 + 1 }).await, Ok(42));
    }

    #[tokio::test]
    async fn test_never_exceeds_concurrency() {
        let queue = ConcurrencyLimiter::new("bounded", QueueOptions::with_concurrency(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut waiting = Vec::new();
        for _ in 0..8 {
            let (active, peak) = (active.clone(), peak.clone());
            let queue = queue.clone();
            waiting.push(tokio::spawn(async move {
                queue
                    .enqueue(async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in waiting {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fifo_start_order() {
        let queue = ConcurrencyLimiter::new("fifo", QueueOptions::with_concurrency(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        // join_all polls in order, so tasks are submitted 0..5.
        let submissions = (0..5).map(|i| {
            let order = order.clone();
            queue.enqueue(async move {
                order.lock().unwrap().push(i);
            })
        });
        for outcome in futures::future::join_all(submissions).await {
            outcome.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_clear_rejects_only_queued_tasks() {
        let queue = ConcurrencyLimiter::new("clear", QueueOptions::with_concurrency(1));
        let (release, gate) = oneshot::channel::<()>();

        let running = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(async move {
                        let _ = gate.await;
                        "finished"
                    })
                    .await
            })
        };
        let queued = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(async { "never" }).await })
        };

        while queue.status().await.unwrap().queued < 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.clear().await, 1);
        assert_eq!(queued.await.unwrap(), Err(QueueError::Cancelled));

        release.send(()).unwrap();
        assert_eq!(running.await.unwrap(), Ok("finished"));
    }

    #[tokio::test]
    async fn test_panicking_task_frees_its_slot() {
        let queue = ConcurrencyLimiter::<u32>::new("panics", QueueOptions::with_concurrency(1));
        let failed = queue.enqueue(async { panic!("kaboom") }).await;
        assert_eq!(failed, Err(QueueError::TaskPanicked("kaboom".into())));
        assert_eq!(queue.enqueue(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_status_reports_concurrency() {
        let queue = ConcurrencyLimiter::<()>::new("status", QueueOptions::with_concurrency(0));
        let status = queue.status().await.unwrap();
        assert_eq!(status.concurrency, 1);
        assert_eq!(status.running, 0);
        assert_eq!(status.queued, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_queue() {
        let queue = ConcurrencyLimiter::new("shutdown", QueueOptions::default());
        queue.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            queue.enqueue(async { 1 }).await,
            Err(QueueError::Closed("shutdown".into()))
        );
    }

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        completed: AtomicUsize,
        failed: AtomicUsize,
    }

    impl TaskObserver for Counting {
        fn on_start(&self, _queue: &str, _task_id: u64) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_complete(&self, _queue: &str, _task_id: u64, _elapsed: Duration) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _queue: &str, _task_id: u64, _error: &QueueError) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_observer_sees_lifecycle() {
        let observer = Arc::new(Counting::default());
        let options = QueueOptions::default().observer(observer.clone());
        let queue = ConcurrencyLimiter::<u8>::new("observed", options);
        queue.enqueue(async { 1 }).await.unwrap();
        let _ = queue.enqueue(async { panic!("no") }).await;

        assert_eq!(observer.started.load(Ordering::SeqCst), 2);
        assert_eq!(observer.completed.load(Ordering::SeqCst), 1);
        assert_eq!(observer.failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registry_shares_queues_by_name() {
        let registry = QueueRegistry::new();
        let a = registry
            .get_or_create::<u32>("runs", QueueOptions::default())
            .unwrap();
        let b = registry
            .get_or_create::<u32>("runs", QueueOptions::with_concurrency(9))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(b.status().await.unwrap().concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(a.enqueue(async { 3 }).await, Ok(3));

        let mismatch = registry.get_or_create::<String>("runs", QueueOptions::default());
        assert!(matches!(mismatch, Err(QueueError::TypeMismatch { .. })));
    }
}
