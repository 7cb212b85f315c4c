// Bounded worker pool for per-segment transcode work.
//
// The queue is seeded with every segment up front and closed; workers drain
// it and exit naturally. The first work error cancels the batch: queued
// segments are skipped, in-flight segments run to completion.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Worker pool sizing and pacing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent transcode workers.
    pub parallel_jobs: usize,
    /// Delay between worker launches, so a fresh batch does not slam the
    /// broadcaster pool with `parallel_jobs` simultaneous requests at t=0.
    pub stagger: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            parallel_jobs: 4,
            stagger: Duration::from_millis(500),
        }
    }
}

type WorkFn<T, E> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

/// Fan per-segment work out to a bounded set of workers, fan the first error
/// back in.
pub struct TranscodePool<T, E> {
    queue: Arc<Mutex<VecDeque<T>>>,
    work: WorkFn<T, E>,
    config: PoolConfig,
    total: usize,
    completed: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    token: CancellationToken,
    err_tx: mpsc::Sender<E>,
    err_rx: Mutex<Option<mpsc::Receiver<E>>>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl<T, E> TranscodePool<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create a pool over `segments` with a per-segment `work` closure.
    pub fn new<F, Fut>(segments: Vec<T>, config: PoolConfig, work: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let total = segments.len();
        // Only the first error is kept; later failures of in-flight work are
        // dropped on the floor by the bounded channel.
        let (err_tx, err_rx) = mpsc::channel(1);
        Self {
            queue: Arc::new(Mutex::new(VecDeque::from(segments))),
            work: Arc::new(move |segment| Box::pin(work(segment))),
            config,
            total,
            completed: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(true)),
            token: CancellationToken::new(),
            err_tx,
            err_rx: Mutex::new(Some(err_rx)),
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers. Worker `i` waits `i * stagger` before its first
    /// pop, which spaces the initial load out without serializing steady
    /// state.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return;
        };
        debug!(workers = self.config.parallel_jobs, total = self.total, "starting transcode pool");

        for i in 0..self.config.parallel_jobs {
            let queue = Arc::clone(&self.queue);
            let work = Arc::clone(&self.work);
            let completed = Arc::clone(&self.completed);
            let running = Arc::clone(&self.running);
            let token = self.token.clone();
            let err_tx = self.err_tx.clone();
            let stagger = self.config.stagger * i as u32;

            join_set.spawn(async move {
                if !stagger.is_zero() {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(stagger) => {}
                    }
                }

                loop {
                    if token.is_cancelled() {
                        break;
                    }
                    let segment = queue.lock().pop_front();
                    let Some(segment) = segment else {
                        break;
                    };
                    match (work)(segment).await {
                        Ok(()) => {
                            completed.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            warn!(worker = i, "segment transcode failed, aborting batch");
                            running.store(false, Ordering::SeqCst);
                            let _ = err_tx.try_send(e);
                            token.cancel();
                            break;
                        }
                    }
                }
            });
        }
    }

    /// Block until the batch finishes or the first error arrives.
    pub async fn wait(&self) -> Result<(), E> {
        let mut join_set = self.tasks.lock().take().unwrap_or_default();
        let mut err_rx = match self.err_rx.lock().take() {
            Some(rx) => rx,
            // Second wait on the same pool: nothing left to observe.
            None => return Ok(()),
        };

        loop {
            tokio::select! {
                Some(err) = err_rx.recv() => {
                    // Remaining workers wind down via the cancelled token.
                    return Err(err);
                }
                joined = join_set.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }

        // All workers returned; surface an error that raced the last join.
        match err_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }

    /// Abort the batch from outside. Queued segments are skipped; in-flight
    /// segments run to completion.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Number of segments in the batch.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of segments completed so far.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// False once the first error arrived or `stop` was called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.token.is_cancelled()
    }
}
