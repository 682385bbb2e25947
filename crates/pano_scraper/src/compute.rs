use crate::error::PipelineError;
use tokio::sync::oneshot;

/// Bounded pool for CPU-heavy work (decoding, stitching, projection,
/// encoding), kept off the async runtime's threads.
pub struct ComputePool {
    pool: rayon::ThreadPool,
}

impl ComputePool {
    /// `threads == 0` uses one thread per core.
    pub fn new(threads: usize) -> Result<Self, PipelineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("compute-{i}"))
            .panic_handler(|_| tracing::error!("Compute job panicked."))
            .build()
            .map_err(|e| PipelineError::ComputePool(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `job` on the pool and awaits its result. Nested rayon
    /// parallelism inside `job` stays on this pool.
    pub async fn run<F, R>(&self, job: F) -> Result<R, PipelineError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = tx.send(job());
        });
        rx.await
            .map_err(|_| PipelineError::ComputePool("compute job panicked".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[tokio::test]
    async fn runs_jobs_on_the_pool() {
        let pool = ComputePool::new(2).unwrap();
        assert_eq!(pool.threads(), 2);
        let sum = pool
            .run(|| (1..=100u64).into_par_iter().sum::<u64>())
            .await
            .unwrap();
        assert_eq!(sum, 5050);

        let name = pool
            .run(|| std::thread::current().name().map(str::to_string))
            .await
            .unwrap();
        assert!(name.unwrap().starts_with("compute-"));
    }
}
