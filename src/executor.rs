//! Bounded parallel mapping for per-item pipeline stages.
//!
//! Stages like digest resolution operate element-wise with no cross-item
//! dependency, so they can run under any of the backends here.  The backend
//! is configuration, not behavior: every backend yields the same values in
//! the same order, and the first failing item (in input order) aborts the
//! map.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};

use crate::error::{PipelineError, Result};

pub const DEFAULT_POOL_SIZE: usize = 10;

/// Execution backend for element-wise pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executor {
    /// One item after another on the calling task.
    Sequential,
    /// Up to `pool_size` items concurrently as runtime tasks.
    Tasks { pool_size: usize },
    /// Up to `pool_size` items concurrently, each driven to completion on
    /// its own dedicated OS thread.  Keeps items that block (subprocesses,
    /// slow peers) from tying up the runtime's worker threads.
    Threads { pool_size: usize },
}

impl Default for Executor {
    fn default() -> Self {
        Executor::Tasks {
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl Executor {
    /// Map `items` through `f`, preserving input order in the output.
    ///
    /// On failure the first error in input order is returned; items already
    /// dispatched by a concurrent backend may still run to completion in
    /// the background, but their results are discarded.
    pub async fn try_map<T, U, F, Fut>(&self, items: Vec<T>, f: F) -> Result<Vec<U>>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        match *self {
            Executor::Sequential => {
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    results.push(f(item).await?);
                }
                Ok(results)
            }
            Executor::Tasks { pool_size } => {
                let semaphore = Arc::new(Semaphore::new(pool_size.max(1)));
                let mut handles = Vec::with_capacity(items.len());
                for item in items {
                    let permit = Arc::clone(&semaphore)
                        .acquire_owned()
                        .await
                        .map_err(|e| PipelineError::Executor(e.to_string()))?;
                    let future = f(item);
                    handles.push(tokio::spawn(async move {
                        let _permit = permit;
                        future.await
                    }));
                }
                let mut results = Vec::with_capacity(handles.len());
                for handle in handles {
                    results.push(
                        handle
                            .await
                            .map_err(|e| PipelineError::Executor(e.to_string()))??,
                    );
                }
                Ok(results)
            }
            Executor::Threads { pool_size } => {
                let semaphore = Arc::new(Semaphore::new(pool_size.max(1)));
                let runtime = Handle::current();
                let mut receivers = Vec::with_capacity(items.len());
                for item in items {
                    let permit = Arc::clone(&semaphore)
                        .acquire_owned()
                        .await
                        .map_err(|e| PipelineError::Executor(e.to_string()))?;
                    let future = f(item);
                    let runtime = runtime.clone();
                    let (sender, receiver) = oneshot::channel();
                    std::thread::spawn(move || {
                        let _permit = permit;
                        let result = runtime.block_on(future);
                        let _ = sender.send(result);
                    });
                    receivers.push(receiver);
                }
                let mut results = Vec::with_capacity(receivers.len());
                for receiver in receivers {
                    results.push(receiver.await.map_err(|_| {
                        PipelineError::Executor("worker thread dropped its result".to_string())
                    })??);
                }
                Ok(results)
            }
        }
    }
}
