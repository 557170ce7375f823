//! Tokio runtime construction and shared cancellation for the scanner.
//!
//! Every long-running piece of the scanner (workers, recon lookups, the
//! result serializer) listens on one `CancellationToken`. Ctrl-C, a fatal
//! sink error, or normal completion all funnel through the same token so
//! shutdown is a single code path.

use anyhow::Result;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ScanHandle {
    inner: Handle,
    cancel: Arc<CancellationToken>,
}

pub struct ScanRuntime {
    runtime: Runtime,
    cancel: Arc<CancellationToken>,
}

impl ScanRuntime {
    /// Build a multi-thread Tokio runtime sized for the scan.
    ///
    /// Worker threads default to Tokio's own heuristic when `None`; the
    /// request-level concurrency bound lives in the worker pool, not here.
    ///
    /// ```
    /// use gatecrash_runtime::ScanRuntime;
    /// use std::time::Duration;
    ///
    /// let runtime = ScanRuntime::build(Some(1)).expect("runtime builds");
    /// let value = runtime.block_on(async { 2 + 2 });
    /// assert_eq!(value, 4);
    /// runtime.shutdown(Duration::from_millis(10));
    /// ```
    pub fn build(worker_threads: Option<usize>) -> Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name("gatecrash-worker");

        if let Some(workers) = worker_threads {
            builder.worker_threads(workers.max(1));
        }

        let runtime = builder.build()?;
        let cancel = Arc::new(CancellationToken::new());
        Ok(Self { runtime, cancel })
    }

    /// Obtain a cloned handle for spawning tasks and sharing cancellation.
    pub fn handle(&self) -> ScanHandle {
        ScanHandle {
            inner: self.runtime.handle().clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Run a future to completion on the runtime.
    pub fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    /// Cancel outstanding work and shut the runtime down gracefully.
    ///
    /// ```
    /// use gatecrash_runtime::ScanRuntime;
    /// use std::time::Duration;
    ///
    /// let runtime = ScanRuntime::build(Some(1)).unwrap();
    /// runtime.shutdown(Duration::from_millis(5));
    /// ```
    pub fn shutdown(self, graceful: std::time::Duration) {
        self.cancel.cancel();
        self.runtime.shutdown_timeout(graceful);
    }
}

impl ScanHandle {
    /// Spawn a future onto the shared runtime handle.
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.spawn(fut)
    }

    /// Clone the shared cancellation token to coordinate shutdown.
    ///
    /// ```
    /// use gatecrash_runtime::ScanRuntime;
    /// use std::time::Duration;
    ///
    /// let runtime = ScanRuntime::build(Some(1)).unwrap();
    /// let handle = runtime.handle();
    /// let cancel = handle.cancellation();
    /// assert!(!cancel.is_cancelled());
    /// cancel.cancel();
    /// assert!(cancel.is_cancelled());
    /// runtime.shutdown(Duration::from_millis(5));
    /// ```
    pub fn cancellation(&self) -> Arc<CancellationToken> {
        self.cancel.clone()
    }

    /// Trip the shared token on the first Ctrl-C so workers finish their
    /// in-flight request and stop. A second Ctrl-C aborts the process.
    pub fn cancel_on_ctrl_c(&self) {
        let cancel = self.cancel.clone();
        self.inner.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("runtime.interrupt.first");
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("runtime.interrupt.second");
                    std::process::exit(130);
                }
            }
        });
    }
}
