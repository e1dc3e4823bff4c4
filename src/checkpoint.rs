use crate::types::{now_rfc3339, ScanCounts};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Resume marker for one scan: the last committed candidate plus running counts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub instance_id: String,
    pub source: String,
    pub last_candidate: String,
    pub counts: ScanCounts,
    pub updated_at: String,
}

impl Checkpoint {
    pub fn new(instance_id: &str, source: &str, last_candidate: &str, counts: ScanCounts) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            source: source.to_string(),
            last_candidate: last_candidate.to_string(),
            counts,
            updated_at: now_rfc3339(),
        }
    }
}

/// Small JSON file overwritten on every save.
///
/// Saves go to a sibling temp file that is then renamed over the target, so a
/// crash mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/CHECKPOINT_<instance>_<source fingerprint>.json`
    pub fn for_session(dir: &Path, instance_id: &str, fingerprint: &str) -> Self {
        Self::new(dir.join(format!("CHECKPOINT_{instance_id}_{fingerprint}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create checkpoint dir: {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(checkpoint)?;
        fs::write(&tmp, json)
            .with_context(|| format!("failed to write checkpoint: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace checkpoint: {}", self.path.display()))?;
        Ok(())
    }

    /// `None` when no checkpoint exists.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let cp = serde_json::from_slice(&bytes).with_context(|| {
                    format!("corrupt checkpoint file: {}", self.path.display())
                })?;
                Ok(Some(cp))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("failed to read checkpoint: {}", self.path.display())),
        }
    }

    /// Remove the checkpoint after a completed scan. Missing files are fine.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to remove checkpoint: {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::for_session(dir.path(), "w1", "range-aaaaa-mzzzz");
        let cp = Checkpoint::new(
            "w1",
            "range aaaaa..=mzzzz",
            "aab3k",
            ScanCounts {
                tested: 40,
                found: 1,
                skipped: 2,
            },
        );
        store.save(&cp).unwrap();
        assert_eq!(store.load().unwrap(), Some(cp));
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("nope.json"));
        assert_eq!(store.load().unwrap(), None);
        store.clear().unwrap();
    }

    #[test]
    fn overwrite_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp.json"));
        store
            .save(&Checkpoint::new("a", "s", "00001", ScanCounts::default()))
            .unwrap();
        let second = Checkpoint::new("a", "s", "00002", ScanCounts::default());
        store.save(&second).unwrap();
        assert_eq!(store.load().unwrap().unwrap().last_candidate, "00002");
        assert!(!dir.path().join("cp.json.tmp").exists());
        store.clear().unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn corrupt_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(CheckpointStore::new(path).load().is_err());
    }
}
