//! Live progress line fed by the pool metrics.

use gatecrash_engine::ScanMetrics;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(300);

/// Spawn the sampler; returns its handle so shutdown can await the final
/// redraw. The bar owns stdout — everything else logs through tracing.
pub fn spawn(metrics: Arc<ScanMetrics>, cancel: CancellationToken) -> JoinHandle<()> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .expect("static template"),
    );

    tokio::spawn(async move {
        loop {
            let snap = metrics.snapshot();
            bar.set_message(format!(
                "{} sent | {} findings | {} errors | {:.0} req/s (avg {:.0}, peak {:.0}) | {} workers",
                snap.completed,
                snap.findings,
                snap.errors,
                snap.instant_rate,
                snap.average_rate,
                snap.peak_rate,
                snap.active_workers,
            ));
            bar.tick();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(TICK) => {}
            }
        }
        let snap = metrics.snapshot();
        bar.finish_with_message(format!(
            "{} requests, {} findings, {} errors in {:.1}s",
            snap.completed, snap.findings, snap.errors, snap.elapsed_secs
        ));
    })
}
