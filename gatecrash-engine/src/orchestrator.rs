//! Scan orchestration: URL × module fan-out.
//!
//! For every target and every selected module the orchestrator asks the
//! module for its payload sequence, drops cross-module duplicates, feeds a
//! fresh worker pool, filters the responses, and appends survivors to the
//! sink as they arrive. Everything the subsystems need — client, budgets,
//! recon cache, tables — is constructed here and passed down as handles;
//! there is no process-wide state.

use anyhow::Context;
use gatecrash_common::ScanConfig;
use gatecrash_http::{HostBudgets, RawClient};
use gatecrash_modules::{BypassModule, ModuleOpts, TableSet};
use gatecrash_payload::{BypassPayload, PayloadToken, TargetUrl};
use gatecrash_recon::ReconCache;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dedup::GlobalDedup;
use crate::metrics::ScanMetrics;
use crate::pool::{PoolConfig, RequestOutcome, RequestPool};
use crate::sink::{Finding, SinkHandle};
use crate::throttle::Pacer;

/// Inputs that come from files/flags rather than the target itself.
#[derive(Debug, Clone, Default)]
pub struct ScanInputs {
    /// Substitute authorities for the host module (`-shf`).
    pub extra_hosts: Vec<String>,
    /// Extra spoof headers (`-spoof-header`).
    pub spoof_headers: Vec<String>,
    /// Extra spoof IPs (`-spoof-ip`).
    pub spoof_ips: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunSummary {
    pub urls: usize,
    pub module_runs: usize,
    pub dispatched: u64,
    pub findings: u64,
}

pub struct Scanner {
    cfg: ScanConfig,
    inputs: ScanInputs,
    tables: Arc<TableSet>,
    recon: Arc<ReconCache>,
    budgets: Arc<HostBudgets>,
    metrics: Arc<ScanMetrics>,
    sink: SinkHandle,
    cancel: CancellationToken,
    scan_id: String,
}

impl Scanner {
    pub fn new(
        cfg: ScanConfig,
        inputs: ScanInputs,
        tables: Arc<TableSet>,
        sink: SinkHandle,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let budgets = Arc::new(HostBudgets::new(
            cfg.max_consecutive_failed_reqs,
            cfg.failure_window,
        ));
        let recon = Arc::new(ReconCache::new(cfg.recon.clone()).context("recon cache setup")?);
        Ok(Self {
            cfg,
            inputs,
            tables,
            recon,
            budgets,
            metrics: Arc::new(ScanMetrics::new()),
            sink,
            cancel,
            scan_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn metrics(&self) -> Arc<ScanMetrics> {
        self.metrics.clone()
    }

    pub fn budgets(&self) -> Arc<HostBudgets> {
        self.budgets.clone()
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    /// Run every selected module against every URL.
    pub async fn run(
        &self,
        urls: &[String],
        modules: &[BypassModule],
    ) -> anyhow::Result<RunSummary> {
        let mut summary = RunSummary {
            urls: urls.len(),
            ..Default::default()
        };

        for url in urls {
            let target = TargetUrl::parse(url)
                .with_context(|| format!("invalid target URL {url:?}"))?;
            // Cross-module dedup is scoped per URL: two targets may share
            // wire bytes legitimately.
            let dedup = Arc::new(GlobalDedup::new());

            for module in modules {
                if self.cancel.is_cancelled() {
                    tracing::info!("scanner.run.cancelled");
                    return Ok(summary);
                }
                let (dispatched, findings) = self
                    .run_module(&target, *module, &dedup)
                    .await
                    .with_context(|| format!("module {module} on {url}"))?;
                summary.module_runs += 1;
                summary.dispatched += dispatched;
                summary.findings += findings;
            }
        }
        Ok(summary)
    }

    /// Decode a debug token and replay it `count` times through a small
    /// dedicated pool.
    pub async fn resend(&self, token: &str, count: usize) -> anyhow::Result<RunSummary> {
        let payload = PayloadToken::decode(token).context("invalid resend token")?;
        tracing::info!(
            url = %payload.original_url,
            module = %payload.bypass_module,
            count,
            "scanner.resend.start"
        );

        let client = Arc::new(RawClient::new(self.cfg.client.clone()).context("client setup")?);
        let pacer = Arc::new(Pacer::new(self.cfg.delay, self.cfg.throttle_max_delay));
        let workers = count.clamp(1, self.cfg.threads);

        let (payload_tx, payload_rx) = mpsc::channel(workers * 2);
        let (results_tx, results_rx) = mpsc::channel(workers * 2);
        let module_cancel = self.cancel.child_token();

        let pool = tokio::spawn(RequestPool::run(
            client.clone(),
            self.budgets.clone(),
            pacer,
            self.metrics.clone(),
            PoolConfig {
                workers,
                max_retries: self.cfg.max_retries,
                retry_delay: self.cfg.retry_delay,
            },
            payload_rx,
            results_tx,
            module_cancel.clone(),
        ));

        let feeder = {
            let cancel = module_cancel.clone();
            tokio::spawn(async move {
                let mut sent = 0u64;
                for _ in 0..count {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if payload_tx.send(payload.clone()).await.is_err() {
                        break;
                    }
                    sent += 1;
                }
                sent
            })
        };

        let findings = self.consume_results(results_rx).await;
        let dispatched = feeder.await.unwrap_or(0);
        pool.await.ok();
        client.drain();

        Ok(RunSummary {
            urls: 1,
            module_runs: 1,
            dispatched,
            findings,
        })
    }

    async fn run_module(
        &self,
        target: &TargetUrl,
        module: BypassModule,
        dedup: &Arc<GlobalDedup>,
    ) -> anyhow::Result<(u64, u64)> {
        tracing::info!(module = %module, url = %target.full_url(), "scanner.module.start");

        // Hosts blocked by a previous module get a fresh chance.
        self.budgets.release_blocks();

        let mut opts = ModuleOpts::new(self.tables.clone());
        opts.extra_hosts = self.inputs.extra_hosts.clone();
        opts.spoof_headers = self.inputs.spoof_headers.clone();
        opts.spoof_ips = self.inputs.spoof_ips.clone();
        if module.wants_recon() {
            opts.resolved_ips = self.warm_recon(target).await;
        }

        let client = Arc::new(RawClient::new(self.cfg.client.clone()).context("client setup")?);
        let pacer = Arc::new(Pacer::new(self.cfg.delay, self.cfg.throttle_max_delay));
        let module_cancel = self.cancel.child_token();

        // Backpressure window: a few payloads per worker, never unbounded.
        let capacity = self.cfg.threads.saturating_mul(4).max(4);
        let (payload_tx, payload_rx) = mpsc::channel::<BypassPayload>(capacity);
        let (results_tx, results_rx) = mpsc::channel::<RequestOutcome>(capacity);

        let pool = tokio::spawn(RequestPool::run(
            client.clone(),
            self.budgets.clone(),
            pacer,
            self.metrics.clone(),
            PoolConfig {
                workers: self.cfg.threads,
                max_retries: self.cfg.max_retries,
                retry_delay: self.cfg.retry_delay,
            },
            payload_rx,
            results_tx,
            module_cancel.clone(),
        ));

        // Feeder: lazy generation, cross-module dedup, bounded send.
        let feeder = {
            let dedup = dedup.clone();
            let cancel = module_cancel.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let mut dispatched = 0u64;
                let mut suppressed = 0u64;
                for payload in module.generate(&target, &opts) {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if !dedup.first_seen(payload.fingerprint()) {
                        suppressed += 1;
                        continue;
                    }
                    if payload_tx.send(payload).await.is_err() {
                        break;
                    }
                    dispatched += 1;
                }
                if suppressed > 0 {
                    tracing::debug!(module = %module, suppressed, "scanner.dedup.suppressed");
                }
                dispatched
            })
        };

        let findings = self.consume_results(results_rx).await;
        let dispatched = feeder.await.unwrap_or(0);
        pool.await.ok();
        client.drain();

        tracing::info!(
            module = %module,
            dispatched,
            findings,
            "scanner.module.done"
        );
        Ok((dispatched, findings))
    }

    /// Apply the response filters and append survivors to the sink as they
    /// arrive. Errors were already recorded against budgets by the pool.
    async fn consume_results(&self, mut results: mpsc::Receiver<RequestOutcome>) -> u64 {
        let mut findings = 0u64;
        while let Some(outcome) = results.recv().await {
            let details = match outcome.result {
                Ok(details) => details,
                Err(_) => continue,
            };

            let filters = &self.cfg.filters;
            if !filters.accepts_status(details.status_code)
                || !filters.accepts_content_type(&details.content_type)
                || !filters.accepts_content_length(details.content_length)
            {
                continue;
            }

            findings += 1;
            self.metrics.finding();
            let finding = Finding::from_response(&self.scan_id, &outcome.payload, &details);
            self.sink.append(vec![finding]).await;
        }
        findings
    }

    /// On-demand recon warming for host-substitution modules. Failure is
    /// not fatal — the module still runs on the host list alone.
    async fn warm_recon(&self, target: &TargetUrl) -> Vec<IpAddr> {
        match self.recon.process_host(&target.host).await {
            Ok(result) => result.all_ips(),
            Err(err) => {
                tracing::warn!(host = %target.host, error = %err, "scanner.recon.failed");
                Vec::new()
            }
        }
    }
}
