//! Bounds concurrent CPU-heavy work across a fixed number of workers,
//! with two lanes — plain fire-and-forget tasks and cancellable tasks
//! paired with a deadline-handle and a single-delivery result channel —
//! and a bounded-degradation fallback when a lane's queue is full.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::deadline::Deadline;
use crate::error::PoolError;
use crate::stats::Counters;

pub type TaskResult = Result<(), anyhow::Error>;
pub type PlainTask = Box<dyn FnOnce() -> TaskResult + Send + 'static>;
pub type ContextTask = Box<dyn FnOnce(Deadline) -> TaskResult + Send + 'static>;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

struct ContextItem {
    task: ContextTask,
    deadline: Deadline,
    reply: oneshot::Sender<TaskResult>,
}

/// A fixed pool of workers consuming from two lanes. Cheap to clone
/// (everything inside is `Arc`-backed); clones share state.
pub struct WorkerPool {
    max_workers: usize,
    state: Arc<AtomicU8>,
    term: CancellationToken,
    plain_tx: mpsc::Sender<PlainTask>,
    plain_rx: Arc<AsyncMutex<mpsc::Receiver<PlainTask>>>,
    ctx_tx: mpsc::Sender<ContextItem>,
    ctx_rx: Arc<AsyncMutex<mpsc::Receiver<ContextItem>>>,
    counters: Arc<Counters>,
    workers: Arc<StdMutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let depth = max_workers.max(1) * 10;
        let (plain_tx, plain_rx) = mpsc::channel(depth);
        let (ctx_tx, ctx_rx) = mpsc::channel(depth);
        Self {
            max_workers: max_workers.max(1),
            state: Arc::new(AtomicU8::new(NOT_STARTED)),
            term: CancellationToken::new(),
            plain_tx,
            plain_rx: Arc::new(AsyncMutex::new(plain_rx)),
            ctx_tx,
            ctx_rx: Arc::new(AsyncMutex::new(ctx_rx)),
            counters: Arc::new(Counters::new()),
            workers: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// One-shot start; returns [`PoolError::AlreadyStarted`] if called
    /// more than once (including after [`Self::stop`]).
    pub fn start(&self) -> Result<(), PoolError> {
        self.state
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| PoolError::AlreadyStarted)?;

        for id in 0..self.max_workers {
            let plain_rx = self.plain_rx.clone();
            let ctx_rx = self.ctx_rx.clone();
            let term = self.term.clone();
            let counters = self.counters.clone();
            let handle = tokio::spawn(async move {
                log::debug!("worker pool: worker {id} starting");
                worker_loop(plain_rx, ctx_rx, term, counters).await;
                log::debug!("worker pool: worker {id} stopped");
            });
            self.workers.lock().expect("worker pool mutex poisoned").push(handle);
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), PoolError> {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => Ok(()),
            STOPPED => Err(PoolError::Stopped),
            _ => Err(PoolError::NotStarted),
        }
    }

    /// Non-blocking submit of a plain task. Degrades to a freshly
    /// scheduled parallel unit if the lane is saturated.
    pub fn submit(&self, task: PlainTask) -> Result<(), PoolError> {
        self.ensure_running()?;
        match self.plain_tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(task)) => {
                log::warn!("worker pool: plain lane saturated, degrading to parallel unit");
                spawn_degraded_plain(task, self.counters.clone());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PoolError::Stopped),
        }
    }

    /// Submits a cancellable task bound to `deadline`, returning a
    /// single-delivery receiver for its result. Fails fast without
    /// enqueueing if `deadline` has already expired.
    pub fn submit_with_context(
        &self,
        deadline: Deadline,
        task: ContextTask,
    ) -> Result<oneshot::Receiver<TaskResult>, PoolError> {
        self.ensure_running()?;
        if deadline.is_expired() {
            return Err(PoolError::DeadlineExpired);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let item = ContextItem {
            task,
            deadline,
            reply: reply_tx,
        };
        match self.ctx_tx.try_send(item) {
            Ok(()) => Ok(reply_rx),
            Err(mpsc::error::TrySendError::Full(item)) => {
                log::warn!("worker pool: context lane saturated, degrading to parallel unit");
                spawn_degraded_context(item, self.counters.clone());
                Ok(reply_rx)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PoolError::Stopped),
        }
    }

    /// Fans `tasks` out under `deadline`, awaiting all of them or the
    /// deadline, whichever comes first. The first per-task error wins.
    pub async fn submit_batch(
        &self,
        deadline: Deadline,
        tasks: Vec<ContextTask>,
    ) -> Result<(), anyhow::Error> {
        let mut receivers = Vec::with_capacity(tasks.len());
        for task in tasks {
            let rx = self.submit_with_context(deadline.clone(), task)?;
            receivers.push(rx);
        }

        let joined = futures::future::join_all(receivers.into_iter().map(|rx| async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("worker dropped result channel")),
            }
        }));

        match deadline.run(joined).await {
            Ok(results) => {
                for result in results {
                    result?;
                }
                Ok(())
            }
            Err(_) => Err(anyhow::Error::new(PoolError::DeadlineExpired)),
        }
    }

    /// Signals termination and waits for in-flight workers to drain.
    /// Idempotent: calling it again after the first call is a no-op.
    pub async fn stop(&self) {
        let prev = self.state.swap(STOPPED, Ordering::SeqCst);
        if prev == STOPPED {
            return;
        }
        self.term.cancel();
        let handles = std::mem::take(&mut *self.workers.lock().expect("worker pool mutex poisoned"));
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    plain_rx: Arc<AsyncMutex<mpsc::Receiver<PlainTask>>>,
    ctx_rx: Arc<AsyncMutex<mpsc::Receiver<ContextItem>>>,
    term: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        tokio::select! {
            biased;
            _ = term.cancelled() => break,
            maybe = async { plain_rx.lock().await.recv().await } => {
                match maybe {
                    Some(task) => run_plain(task, &counters).await,
                    None => break,
                }
            }
            maybe = async { ctx_rx.lock().await.recv().await } => {
                match maybe {
                    Some(item) => run_context(item, &counters).await,
                    None => break,
                }
            }
        }
    }
}

async fn run_plain(task: PlainTask, counters: &Counters) {
    let start = Instant::now();
    let outcome = tokio::task::spawn_blocking(task).await;
    match outcome {
        Ok(Ok(())) => counters.record_success(start.elapsed(), 0),
        _ => counters.record_failure(start.elapsed()),
    }
}

async fn run_context(item: ContextItem, counters: &Counters) {
    let ContextItem { task, deadline, reply } = item;
    let start = Instant::now();

    if deadline.is_expired() {
        counters.record_failure(start.elapsed());
        let _ = reply.send(Err(anyhow::Error::new(crate::deadline::DeadlineExceeded)));
        return;
    }

    let handle_deadline = deadline.clone();
    let result = tokio::select! {
        _ = handle_deadline.cancelled() => Err(anyhow::Error::new(crate::deadline::DeadlineExceeded)),
        outcome = tokio::task::spawn_blocking(move || task(deadline)) => {
            match outcome {
                Ok(inner) => inner,
                Err(join_err) => Err(anyhow::anyhow!("worker task panicked: {join_err}")),
            }
        }
    };

    match &result {
        Ok(()) => counters.record_success(start.elapsed(), 0),
        Err(_) => counters.record_failure(start.elapsed()),
    }
    // Never block on an undeliverable result: the receiver may already
    // be gone if the caller stopped waiting.
    let _ = reply.send(result);
}

fn spawn_degraded_plain(task: PlainTask, counters: Arc<Counters>) {
    tokio::spawn(async move {
        run_plain(task, &counters).await;
    });
}

fn spawn_degraded_context(item: ContextItem, counters: Arc<Counters>) {
    tokio::spawn(async move {
        run_context(item, &counters).await;
    });
}
