//! Result sink contract and the single-writer serializer in front of it.
//!
//! Sinks are append-only and must be crash-safe: a batch is either fully
//! visible or absent. Concurrency is the serializer's problem, not the
//! sink's — every worker outcome funnels through one channel into one
//! writer task, so implementations never see concurrent appends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatecrash_http::ResponseDetails;
use gatecrash_payload::BypassPayload;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One persisted finding: a response that survived the orchestrator's
/// filters, joined with the payload that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub scan_id: String,
    pub timestamp: DateTime<Utc>,
    pub target_url: String,
    pub module: String,
    pub method: String,
    pub raw_uri: String,
    pub status_code: u16,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub response_bytes: u64,
    pub title: String,
    pub server: String,
    pub redirect: String,
    pub response_time_ms: u64,
    pub debug_token: String,
}

impl Finding {
    pub fn from_response(
        scan_id: &str,
        payload: &BypassPayload,
        details: &ResponseDetails,
    ) -> Self {
        Self {
            scan_id: scan_id.to_string(),
            timestamp: Utc::now(),
            target_url: payload.original_url.clone(),
            module: payload.bypass_module.clone(),
            method: payload.method.clone(),
            raw_uri: payload.raw_uri.clone(),
            status_code: details.status_code,
            content_type: details.content_type.clone(),
            content_length: details.content_length,
            response_bytes: details.response_bytes,
            title: details.title.clone(),
            server: details.server_info.clone(),
            redirect: details.redirect_url.clone(),
            response_time_ms: details.response_time.as_millis() as u64,
            debug_token: details.debug_token.clone(),
        }
    }
}

/// Append-only storage contract. Implemented by the app (JSONL, SQLite).
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn append(&self, findings: Vec<Finding>) -> anyhow::Result<()>;
    /// Flush buffered state; called once at shutdown.
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handle the orchestrator writes findings through. Cloneable; dropping all
/// clones ends the serializer task.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<Vec<Finding>>,
}

impl SinkHandle {
    pub async fn append(&self, findings: Vec<Finding>) {
        if findings.is_empty() {
            return;
        }
        if self.tx.send(findings).await.is_err() {
            tracing::error!("sink.append.serializer_gone");
        }
    }
}

/// Spawn the single-writer task in front of `sink`. Returns the handle and
/// the join handle to await at shutdown.
pub fn spawn_serializer(
    sink: Box<dyn ResultSink>,
    capacity: usize,
) -> (SinkHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Vec<Finding>>(capacity.max(1));
    let task = tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            let count = batch.len();
            if let Err(err) = sink.append(batch).await {
                tracing::error!(error = %err, count, "sink.append.failed");
            }
        }
        if let Err(err) = sink.flush().await {
            tracing::error!(error = %err, "sink.flush.failed");
        }
    });
    (SinkHandle { tx }, task)
}

/// Read-time ordering for reports: `(status_code, module)`; persistence
/// order stays arrival order.
pub fn sort_for_report(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        (a.status_code, a.module.as_str()).cmp(&(b.status_code, b.module.as_str()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct MemSink {
        rows: Arc<Mutex<Vec<Finding>>>,
        flushed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl ResultSink for MemSink {
        async fn append(&self, findings: Vec<Finding>) -> anyhow::Result<()> {
            self.rows.lock().unwrap().extend(findings);
            Ok(())
        }
        async fn flush(&self) -> anyhow::Result<()> {
            *self.flushed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn finding(status: u16, module: &str) -> Finding {
        Finding {
            scan_id: "s".into(),
            timestamp: Utc::now(),
            target_url: "http://h/x".into(),
            module: module.into(),
            method: "GET".into(),
            raw_uri: "/x".into(),
            status_code: status,
            content_type: String::new(),
            content_length: None,
            response_bytes: 0,
            title: String::new(),
            server: String::new(),
            redirect: String::new(),
            response_time_ms: 1,
            debug_token: "t".into(),
        }
    }

    #[tokio::test]
    async fn serializer_preserves_batches_and_flushes() {
        let sink = MemSink::default();
        let (handle, task) = spawn_serializer(Box::new(sink.clone()), 8);

        handle.append(vec![finding(200, "a")]).await;
        handle.append(vec![finding(301, "b"), finding(200, "c")]).await;
        handle.append(vec![]).await; // no-op
        drop(handle);
        task.await.unwrap();

        assert_eq!(sink.rows.lock().unwrap().len(), 3);
        assert!(*sink.flushed.lock().unwrap());
    }

    #[test]
    fn report_order_is_status_then_module() {
        let mut rows = vec![finding(403, "b"), finding(200, "z"), finding(200, "a")];
        sort_for_report(&mut rows);
        let key: Vec<_> = rows
            .iter()
            .map(|f| (f.status_code, f.module.clone()))
            .collect();
        assert_eq!(
            key,
            vec![(200, "a".into()), (200, "z".into()), (403, "b".into())]
        );
    }
}
