//! JSON-lines sink: one finding per line, fsynced per batch so a killed
//! process leaves whole lines or nothing.

use async_trait::async_trait;
use gatecrash_engine::{Finding, ResultSink};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl ResultSink for JsonlSink {
    async fn append(&self, findings: Vec<Finding>) -> anyhow::Result<()> {
        // Serialize outside the lock; write the batch as one buffer so a
        // crash cannot interleave partial lines from other batches.
        let mut buf = Vec::with_capacity(findings.len() * 256);
        for finding in &findings {
            serde_json::to_writer(&mut buf, finding)?;
            buf.push(b'\n');
        }
        let mut file = self.file.lock().expect("jsonl lock");
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }
}
