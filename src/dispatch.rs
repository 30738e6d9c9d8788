//! Worker pool and group dispatcher
//!
//! A current-thread tokio runtime is driven from a dedicated background
//! thread for one load. Each blocking platform call runs on the runtime's
//! blocking pool, capped at the configured worker count. Groups run strictly
//! in order; the batches of a group run concurrently and the group settles
//! before the next one starts.

use crate::error::{BatchError, CocoonError};
use futures::future::try_join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Semaphore;

pub const DEFAULT_WORKERS: usize = 5;

/// How long shutdown waits for calls still running on worker threads
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of one dispatched batch
pub type CallOutcome<R> = Result<R, BatchError>;

/// Runtime plus bounded worker threads, owned by a single load
pub struct WorkerPool {
    runtime: Option<Runtime>,
    permits: Arc<Semaphore>,
    workers: usize,
    call_timeout: Option<Duration>,
}

impl WorkerPool {
    pub fn new(workers: usize, call_timeout: Option<Duration>) -> Result<Self, CocoonError> {
        let workers = workers.max(1);
        let runtime = Builder::new_current_thread()
            .enable_all()
            .max_blocking_threads(workers)
            .thread_name("cocoon-worker")
            .build()?;

        tracing::debug!("Worker pool started with {} workers", workers);
        Ok(Self {
            runtime: Some(runtime),
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            call_timeout,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Drive `future` to completion on the pool's background thread
    pub fn run<F>(&self, future: F) -> Result<F::Output, CocoonError>
    where
        F: Future + Send,
        F::Output: Send,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| CocoonError::Dispatch("worker pool is shut down".into()))?;

        std::thread::scope(|scope| {
            let handle = std::thread::Builder::new()
                .name("cocoon-dispatch".into())
                .spawn_scoped(scope, || runtime.block_on(future))?;
            handle
                .join()
                .map_err(|_| CocoonError::Dispatch("dispatch thread panicked".into()))
        })
    }

    /// Run one blocking call on a worker thread
    pub fn call<T, R, F>(&self, item: T, call: F) -> Result<CallOutcome<R>, CocoonError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> CallOutcome<R> + Send + Sync + 'static,
    {
        let call = Arc::new(call);
        self.run(self.settle(item, call))?
    }

    /// Run every group in order, the items of a group concurrently.
    ///
    /// Outcomes come back flattened in group then insertion order, whatever
    /// order the calls finished in. A [`BatchError`] is an ordinary outcome;
    /// a panicking call aborts the whole dispatch.
    pub fn dispatch_groups<T, R, F>(
        &self,
        groups: Vec<Vec<T>>,
        call: F,
    ) -> Result<Vec<CallOutcome<R>>, CocoonError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> CallOutcome<R> + Send + Sync + 'static,
    {
        let call = Arc::new(call);
        let total = groups.len();

        self.run(async {
            let mut outcomes = Vec::new();
            for (index, group) in groups.into_iter().enumerate() {
                tracing::debug!(
                    "Dispatching group {}/{} ({} batches)",
                    index + 1,
                    total,
                    group.len()
                );
                let pending = group
                    .into_iter()
                    .map(|item| self.settle(item, Arc::clone(&call)));
                outcomes.extend(try_join_all(pending).await?);
            }
            Ok::<_, CocoonError>(outcomes)
        })?
    }

    async fn settle<T, R, F>(&self, item: T, call: Arc<F>) -> Result<CallOutcome<R>, CocoonError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> CallOutcome<R> + Send + Sync + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| CocoonError::Dispatch(e.to_string()))?;

        // the permit is held until the call returns
        let mut handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            call(item)
        });
        let joined = match self.call_timeout {
            None => handle.await,
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(
                        "Call exceeded {:?}, reporting a timeout once it returns",
                        limit
                    );
                    // the group does not settle while the call is still running
                    handle.await.map_err(|e| {
                        CocoonError::Dispatch(format!("worker call failed: {e}"))
                    })?;
                    return Ok(Err(BatchError::Timeout {
                        secs: limit.as_secs(),
                    }));
                }
            },
        };

        joined.map_err(|e| CocoonError::Dispatch(format!("worker call failed: {e}")))
    }

    /// Stop the runtime, waiting at most [`SHUTDOWN_GRACE`] for running calls
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
            tracing::debug!("Worker pool stopped");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
