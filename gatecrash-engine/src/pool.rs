//! Bounded worker pool driving the raw client.
//!
//! Exactly `workers` tasks pull from one bounded payload channel, pace on
//! the shared [`Pacer`], send through the shared client, and push outcomes.
//! Retries happen inside the worker (linear backoff, retryable kinds only);
//! the per-host budget is charged once per payload, after the retry budget
//! is spent, which is what keeps the halt arithmetic at
//! `max_cfr × (1 + max_retries)` wire attempts for a dead host.
//!
//! A halt is host-scoped: once a dial authority is over budget its
//! remaining payloads short-circuit as `PermanentHost` outcomes with no
//! wire attempt, while payloads for every other authority in the same run
//! keep flowing. The cancellation token is reserved for run-level shutdown
//! (Ctrl-C, orchestrator teardown), never for a single bad host.

use gatecrash_http::{Action, ClientError, ErrorKind, HostBudgets, RawClient, ResponseDetails};
use gatecrash_payload::BypassPayload;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::metrics::ScanMetrics;
use crate::throttle::Pacer;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

/// One payload's terminal outcome: a classified response or a classified
/// error. HTTP statuses are always the `Ok` side.
#[derive(Debug)]
pub struct RequestOutcome {
    pub payload: BypassPayload,
    pub result: Result<ResponseDetails, ClientError>,
}

/// The dial authority is what error budgets key on; for host-substitution
/// payloads that is the substituted target, not the Host header.
fn budget_host(payload: &BypassPayload) -> &str {
    payload.connect_to.as_deref().unwrap_or(&payload.host)
}

pub struct RequestPool;

impl RequestPool {
    /// Run payloads to completion. Returns when the payload channel closes
    /// and every worker has drained. The caller owns channel construction
    /// so it can size the backpressure window.
    pub async fn run(
        client: Arc<RawClient>,
        budgets: Arc<HostBudgets>,
        pacer: Arc<Pacer>,
        metrics: Arc<ScanMetrics>,
        cfg: PoolConfig,
        payloads: mpsc::Receiver<BypassPayload>,
        results: mpsc::Sender<RequestOutcome>,
        cancel: CancellationToken,
    ) {
        let shared_rx = Arc::new(tokio::sync::Mutex::new(payloads));
        let mut workers = JoinSet::new();

        for worker_id in 0..cfg.workers.max(1) {
            let client = client.clone();
            let budgets = budgets.clone();
            let pacer = pacer.clone();
            let metrics = metrics.clone();
            let cfg = cfg.clone();
            let shared_rx = shared_rx.clone();
            let results = results.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                worker_loop(
                    worker_id, client, budgets, pacer, metrics, cfg, shared_rx, results, cancel,
                )
                .await;
            });
        }
        drop(results);

        while workers.join_next().await.is_some() {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    client: Arc<RawClient>,
    budgets: Arc<HostBudgets>,
    pacer: Arc<Pacer>,
    metrics: Arc<ScanMetrics>,
    cfg: PoolConfig,
    shared_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BypassPayload>>>,
    results: mpsc::Sender<RequestOutcome>,
    cancel: CancellationToken,
) {
    metrics.worker_started();
    tracing::debug!(worker_id, "pool.worker.start");

    loop {
        let payload = {
            let mut rx = shared_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                received = rx.recv() => received,
            }
        };
        let Some(payload) = payload else {
            break;
        };

        // A host already past its budget gets no further wire attempts.
        let host = budget_host(&payload).to_string();
        if budgets.is_blocked(&host) {
            let outcome = RequestOutcome {
                result: Err(ClientError::new(
                    ErrorKind::PermanentHost,
                    &host,
                    "pool",
                    "host exceeded failure budget",
                )),
                payload,
            };
            metrics.completed(true);
            if results.send(outcome).await.is_err() {
                break;
            }
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = pacer.pace() => {}
        }

        metrics.submitted();
        let result = send_with_retries(&client, &payload, &cfg, &metrics, &cancel).await;

        match &result {
            Ok(details) => {
                budgets.success(&host);
                pacer.observe_status(details.status_code);
            }
            Err(err) => {
                tracing::debug!(
                    worker_id,
                    host = %err.host,
                    kind = err.kind.as_str(),
                    source = err.step,
                    "pool.request.error"
                );
                if budgets.record(&err.host, err.kind) == Action::HaltModuleForHost {
                    // Host-scoped only: this host's later payloads die in the
                    // is_blocked check above; other hosts keep going.
                    tracing::warn!(host = %err.host, "pool.halt.host_budget");
                }
            }
        }

        metrics.completed(result.is_err());
        let outcome = RequestOutcome { payload, result };
        if results.send(outcome).await.is_err() {
            break;
        }
    }

    metrics.worker_stopped();
    tracing::debug!(worker_id, "pool.worker.stop");
}

async fn send_with_retries(
    client: &RawClient,
    payload: &BypassPayload,
    cfg: &PoolConfig,
    metrics: &ScanMetrics,
    cancel: &CancellationToken,
) -> Result<ResponseDetails, ClientError> {
    let mut attempt: u32 = 0;
    loop {
        match client.send(payload).await {
            Ok(details) => return Ok(details),
            Err(err) if err.retryable && attempt < cfg.max_retries && !cancel.is_cancelled() => {
                attempt += 1;
                metrics.retried();
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..25));
                let backoff = cfg.retry_delay * attempt + jitter;
                tracing::debug!(
                    attempt,
                    max = cfg.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    kind = err.kind.as_str(),
                    "pool.worker.retry"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(err),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}
