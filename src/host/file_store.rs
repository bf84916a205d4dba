//! Gate ids persisted as one JSON file per run

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{HostError, RunInfo, RunStore};

#[derive(Debug, Serialize, Deserialize)]
struct RunRecord {
    run: String,
    #[serde(default)]
    gates: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct JsonRunStore {
    dir: PathBuf,
}

impl JsonRunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run: &RunInfo) -> PathBuf {
        let name: String = run
            .key()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl RunStore for JsonRunStore {
    async fn save_gate_ids(&self, run: &RunInfo, ids: &[String]) -> Result<(), HostError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let record = RunRecord {
            run: run.key(),
            gates: ids.to_vec(),
        };
        let content = serde_json::to_vec_pretty(&record)?;

        let path = self.path_for(run);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Saved {} gate ids to {}", ids.len(), path.display());
        Ok(())
    }

    async fn load_gate_ids(&self, run: &RunInfo) -> Result<Vec<String>, HostError> {
        let path = self.path_for(run);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let record: RunRecord = serde_json::from_slice(&content)?;
        Ok(record.gates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_record_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonRunStore::new(dir.path());
        let ids = store.load_gate_ids(&RunInfo::new(1, "app")).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonRunStore::new(dir.path().join("state"));
        let run = RunInfo::new(4, "team/app");

        store
            .save_gate_ids(&run, &["Release".to_string()])
            .await
            .unwrap();
        assert_eq!(store.load_gate_ids(&run).await.unwrap(), vec!["Release"]);

        store.save_gate_ids(&run, &[]).await.unwrap();
        assert!(store.load_gate_ids(&run).await.unwrap().is_empty());
        assert!(!store.path_for(&run).with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_runs_do_not_share_files() {
        let dir = TempDir::new().unwrap();
        let store = JsonRunStore::new(dir.path());
        assert_ne!(
            store.path_for(&RunInfo::new(1, "team/app")),
            store.path_for(&RunInfo::new(2, "team/app"))
        );
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonRunStore::new(dir.path());
        let run = RunInfo::new(1, "app");
        std::fs::write(store.path_for(&run), "not json").unwrap();
        assert!(matches!(
            store.load_gate_ids(&run).await,
            Err(HostError::Serialization(_))
        ));
    }
}
