//! Result sink implementations behind the engine's append-only contract.

mod jsonl;
mod sqlite;

pub use jsonl::JsonlSink;
pub use sqlite::SqliteSink;

use gatecrash_engine::ResultSink;
use std::path::Path;

/// `.db`/`.sqlite`/`.sqlite3` files get the SQLite sink, everything else
/// JSONL.
pub fn is_sqlite(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    matches!(ext.as_str(), "db" | "sqlite" | "sqlite3")
}

pub async fn open_sink(path: &Path) -> anyhow::Result<Box<dyn ResultSink>> {
    if is_sqlite(path) {
        Ok(Box::new(SqliteSink::open(path).await?))
    } else {
        Ok(Box::new(JsonlSink::open(path)?))
    }
}
