//! Result store: the write-once sink that receives run summaries.
//!
//! Only the interface and the two local sinks live here; SQL and object
//! storage backends are external adapters. A run id can be stored once;
//! distinct run ids may store concurrently.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::info;

use crate::error::SimError;
use crate::summary::RunSummary;
use crate::SimResult;

pub trait ResultStore: Send + Sync {
    /// Persist a summary. Fails on a duplicate run id.
    fn store_result(&self, run_id: &str, summary: &RunSummary) -> SimResult<()>;
    fn get_result(&self, run_id: &str) -> SimResult<Option<Value>>;
    /// Run ids, newest first.
    fn list_results(&self, limit: usize, offset: usize) -> SimResult<Vec<String>>;
    fn delete_result(&self, run_id: &str) -> SimResult<bool>;
}

fn store_error(message: impl Into<String>) -> SimError {
    SimError::Internal {
        module: "result_store".into(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryResultStore {
    results: RwLock<BTreeMap<String, Value>>,
    order: RwLock<Vec<String>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultStore for InMemoryResultStore {
    fn store_result(&self, run_id: &str, summary: &RunSummary) -> SimResult<()> {
        let value = summary.to_sanitized_json()?;
        let mut results = self
            .results
            .write()
            .map_err(|_| store_error("results lock poisoned"))?;
        if results.contains_key(run_id) {
            return Err(store_error(format!("run {run_id} already stored")));
        }
        results.insert(run_id.to_string(), value);
        self.order
            .write()
            .map_err(|_| store_error("order lock poisoned"))?
            .push(run_id.to_string());
        Ok(())
    }

    fn get_result(&self, run_id: &str) -> SimResult<Option<Value>> {
        let results = self
            .results
            .read()
            .map_err(|_| store_error("results lock poisoned"))?;
        Ok(results.get(run_id).cloned())
    }

    fn list_results(&self, limit: usize, offset: usize) -> SimResult<Vec<String>> {
        let order = self
            .order
            .read()
            .map_err(|_| store_error("order lock poisoned"))?;
        Ok(order.iter().rev().skip(offset).take(limit).cloned().collect())
    }

    fn delete_result(&self, run_id: &str) -> SimResult<bool> {
        let removed = self
            .results
            .write()
            .map_err(|_| store_error("results lock poisoned"))?
            .remove(run_id)
            .is_some();
        if removed {
            self.order
                .write()
                .map_err(|_| store_error("order lock poisoned"))?
                .retain(|id| id != run_id);
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// JSON-file sink rooted at `RESULTS_DIR` (default `results/`). One file
/// per run id.
pub struct FileResultStore {
    root: PathBuf,
}

impl FileResultStore {
    pub fn new(root: impl Into<PathBuf>) -> SimResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| store_error(format!("create {}: {e}", root.display())))?;
        Ok(FileResultStore { root })
    }

    /// Root taken from the `RESULTS_DIR` environment variable.
    pub fn from_env() -> SimResult<Self> {
        let root = std::env::var("RESULTS_DIR").unwrap_or_else(|_| "results".to_string());
        Self::new(root)
    }

    fn path_for(&self, run_id: &str) -> SimResult<PathBuf> {
        // Run ids become file names; reject separators outright.
        if run_id.is_empty() || run_id.contains(['/', '\\', '.']) {
            return Err(store_error(format!("invalid run id {run_id:?}")));
        }
        Ok(self.root.join(format!("{run_id}.json")))
    }
}

impl ResultStore for FileResultStore {
    fn store_result(&self, run_id: &str, summary: &RunSummary) -> SimResult<()> {
        let path = self.path_for(run_id)?;
        if path.exists() {
            return Err(store_error(format!("run {run_id} already stored")));
        }
        let value = summary.to_sanitized_json()?;
        let body = serde_json::to_vec_pretty(&value)?;
        std::fs::write(&path, body)
            .map_err(|e| store_error(format!("write {}: {e}", path.display())))?;
        info!(run_id, path = %path.display(), "result stored");
        Ok(())
    }

    fn get_result(&self, run_id: &str) -> SimResult<Option<Value>> {
        let path = self.path_for(run_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let body = std::fs::read(&path)
            .map_err(|e| store_error(format!("read {}: {e}", path.display())))?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    fn list_results(&self, limit: usize, offset: usize) -> SimResult<Vec<String>> {
        let mut entries: Vec<(std::time::SystemTime, String)> = Vec::new();
        let dir = std::fs::read_dir(&self.root)
            .map_err(|e| store_error(format!("read dir {}: {e}", self.root.display())))?;
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    let modified = entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(std::time::UNIX_EPOCH);
                    entries.push((modified, stem.to_string()));
                }
            }
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, id)| id)
            .collect())
    }

    fn delete_result(&self, run_id: &str) -> SimResult<bool> {
        let path = self.path_for(run_id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .map_err(|e| store_error(format!("delete {}: {e}", path.display())))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{run_with_tls, RunOptions};
    use crate::config::SimulationConfig;
    use crate::tls::MockTlsDataSource;
    use std::sync::Arc;

    fn sample_summary(run_id: &str) -> RunSummary {
        let mut config = SimulationConfig::default();
        config.fund_size = 2_000_000.0;
        config.fund_term = 3;
        config.reinvestment_period = 0;
        run_with_tls(
            config,
            Arc::new(MockTlsDataSource::new(30, 5, 1)),
            RunOptions {
                run_id: Some(run_id.to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = InMemoryResultStore::new();
        let summary = sample_summary("mem-1");
        store.store_result("mem-1", &summary).unwrap();

        let loaded = store.get_result("mem-1").unwrap().unwrap();
        assert_eq!(loaded["run_id"], serde_json::json!("mem-1"));

        // Write-once per run id.
        assert!(store.store_result("mem-1", &summary).is_err());

        assert_eq!(store.list_results(10, 0).unwrap(), vec!["mem-1"]);
        assert!(store.delete_result("mem-1").unwrap());
        assert!(!store.delete_result("mem-1").unwrap());
        assert!(store.get_result("mem-1").unwrap().is_none());
    }

    #[test]
    fn test_memory_store_list_pagination() {
        let store = InMemoryResultStore::new();
        for i in 0..5 {
            let id = format!("run-{i}");
            store.store_result(&id, &sample_summary(&id)).unwrap();
        }
        // Newest first.
        assert_eq!(store.list_results(2, 0).unwrap(), vec!["run-4", "run-3"]);
        assert_eq!(store.list_results(2, 2).unwrap(), vec!["run-2", "run-1"]);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!(
            "fund-sim-store-test-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let store = FileResultStore::new(&dir).unwrap();
        let summary = sample_summary("file-1");

        store.store_result("file-1", &summary).unwrap();
        assert!(store.store_result("file-1", &summary).is_err());

        let loaded = store.get_result("file-1").unwrap().unwrap();
        assert_eq!(loaded["status"], serde_json::json!("completed"));
        assert_eq!(store.list_results(10, 0).unwrap(), vec!["file-1"]);
        assert!(store.delete_result("file-1").unwrap());
        assert!(store.get_result("file-1").unwrap().is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_file_store_rejects_path_traversal() {
        let dir = std::env::temp_dir().join(format!(
            "fund-sim-store-guard-{}",
            std::process::id()
        ));
        let store = FileResultStore::new(&dir).unwrap();
        assert!(store.get_result("../etc/passwd").is_err());
        assert!(store.get_result("a.b").is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
