use std::{
    num::NonZeroUsize,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, OnceLock, PoisonError, mpsc},
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    hnsw::normalize,
};

/// Turns text into fixed-length vectors.
///
/// Implementations must be deterministic for a given `model_id`: the same
/// text always yields the same vector, and every vector has length
/// [`dimension`](Self::dimension).
pub trait EmbeddingProvider: Send + Sync {
    /// Identifies the model and version. Snapshots record it, and a
    /// snapshot written under another id is refused.
    fn model_id(&self) -> &str;

    /// Length of every produced vector. May load the model.
    fn dimension(&self) -> Result<usize>;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

type Task = Box<dyn FnOnce(&dyn EmbeddingProvider) + Send>;

struct Job {
    /// The caller stops waiting at this instant; later jobs are skipped.
    deadline: Instant,
    task: Task,
}

/// Lazily spawned worker threads plus the cached provider dimension,
/// shared by every clone of an [`Embedder`].
#[derive(Default)]
struct Pool {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    dimension: OnceLock<usize>,
}

fn run_worker(
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    provider: Arc<dyn EmbeddingProvider>,
) {
    loop {
        let job = jobs.lock().unwrap_or_else(PoisonError::into_inner).recv();
        // Every sender is gone: the embedder was dropped.
        let Ok(job) = job else {
            return;
        };
        if Instant::now() >= job.deadline {
            debug!("skipping embedding job, caller already timed out");
            continue;
        }
        let task = job.task;
        if catch_unwind(AssertUnwindSafe(|| task(provider.as_ref()))).is_err() {
            warn!(model = provider.model_id(), "embedding provider panicked");
        }
    }
}

/// Calls an [`EmbeddingProvider`] with a bounded timeout and retries.
///
/// Provider calls run on a fixed set of long-lived worker threads, so a
/// stalled provider ties up at most that many threads. A caller that times
/// out gets [`Error::EmbeddingTimeout`]; its job is skipped if no worker
/// has picked it up yet. Timeouts are never retried here, since the stalled
/// call may still hold the provider.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
    attempts: usize,
    workers: usize,
    pool: Arc<Pool>,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        let workers = std::thread::available_parallelism()
            .map_or(1, NonZeroUsize::get);
        Self {
            provider,
            timeout: Duration::from_secs(30),
            attempts: 2,
            workers,
            pool: Arc::new(Pool::default()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Total number of tries for provider failures, at least 1.
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Number of worker threads, at least 1. Takes effect if no call has
    /// been made yet.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    /// Vector length of the provider, asked once under the timeout and then
    /// cached.
    pub fn dimension(&self) -> Result<usize> {
        if let Some(&dim) = self.pool.dimension.get() {
            return Ok(dim);
        }
        let dim = self.with_retries(|| self.call(|p| p.dimension()))?;
        Ok(*self.pool.dimension.get_or_init(|| dim))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Embed `text`, retrying provider failures.
    ///
    /// A vector of the wrong length is reported as
    /// [`Error::DimensionMismatch`] and not retried.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let expected = self.dimension()?;
        let vector = self.with_retries(|| {
            let text = text.to_string();
            self.call(move |p| p.embed(&text))
        })?;
        if vector.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                got: vector.len(),
            });
        }
        Ok(vector)
    }

    fn with_retries<T>(&self, mut call: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match call() {
                Err(e @ Error::Embedding(_)) if attempt < self.attempts => {
                    warn!(
                        model = self.provider.model_id(),
                        attempt,
                        error = %e,
                        "embedding failed, retrying"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        let mut guard =
            self.pool.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = guard.as_ref() {
            return Ok(sender.clone());
        }

        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        for _ in 0..self.workers {
            let jobs = Arc::clone(&receiver);
            let provider = Arc::clone(&self.provider);
            std::thread::Builder::new()
                .name("ragdex-embed".into())
                .spawn(move || run_worker(jobs, provider))?;
        }
        debug!(workers = self.workers, "embedding workers started");
        *guard = Some(sender.clone());
        Ok(sender)
    }

    /// Run `f` against the provider on a worker, waiting at most the
    /// configured timeout.
    fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn EmbeddingProvider) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job = Job {
            deadline: Instant::now() + self.timeout,
            task: Box::new(move |provider: &dyn EmbeddingProvider| {
                let _ = tx.send(f(provider));
            }),
        };
        self.sender()?.send(job).map_err(|_| {
            Error::Embedding("embedding workers have stopped".into())
        })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                debug!(timeout = ?self.timeout, "embedding call timed out");
                Err(Error::EmbeddingTimeout {
                    timeout: self.timeout,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::Embedding(
                "embedding worker exited without a result".into(),
            )),
        }
    }
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("model_id", &self.provider.model_id())
            .field("timeout", &self.timeout)
            .field("attempts", &self.attempts)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

/// Model-free bag-of-words embeddings via feature hashing.
///
/// Each lower-cased alphanumeric token is hashed with blake3 into one of
/// `dimension` buckets with a pseudo-random sign; the counts are then
/// normalised. Texts with the same tokens get the same vector, and texts
/// sharing no tokens are close to orthogonal.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_id: format!("hashing-blake3-{dimension}"),
        }
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Result<usize> {
        Ok(self.dimension)
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let tokens = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);

        for token in tokens {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut head = [0u8; 8];
            head.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(head) % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        normalize(&mut vector);
        Ok(vector)
    }
}
