//! Persistent signature store
//!
//! Remembers, per task output set, the signature recorded at the last
//! successful run. A task is stale when it has no record, when one of its
//! outputs is missing, or when its fresh signature differs from the record.
//!
//! A task that generated other tasks while running is also stale when any
//! of those (recursively) lacks a record, lost an output, or saw one of its
//! watched files change. Generated tasks only exist once their creator runs,
//! so the creator's record stands in for them.
//!
//! The store lives in `<build_dir>/.bob/signatures.json`. An unreadable
//! store is treated as empty so the worst case is a full rebuild.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BobError, Result};
use crate::project::Task;
use crate::signature::{self, Signature};

/// Store location relative to the build directory
pub const STORE_FILE: &str = ".bob/signatures.json";

const STORE_VERSION: u32 = 2;

/// Record of a successful execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Hex signature at the time of success
    pub signature: String,
    /// Task name
    pub task: String,
    /// When the record was written
    pub succeeded_at: chrono::DateTime<chrono::Utc>,
    /// Duration of the successful execution
    pub duration_ms: u64,
    /// Outputs at the time of success
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    /// Inputs and scanned dependencies
    #[serde(default)]
    pub watched: Vec<PathBuf>,
    /// Digest of the watched files' contents
    #[serde(default)]
    pub watched_digest: String,
    /// Store keys of the tasks generated by this run
    #[serde(default)]
    pub children: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: BTreeMap<String, SignatureRecord>,
}

/// Why a task has to run, or that it does not
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    NoRecord,
    MissingOutput(PathBuf),
    Changed,
    StaleChild(String),
    ScanFailed,
    Forced,
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Staleness::Fresh)
    }
}

impl std::fmt::Display for Staleness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Staleness::Fresh => write!(f, "up to date"),
            Staleness::NoRecord => write!(f, "never built"),
            Staleness::MissingOutput(p) => write!(f, "output {} missing", p.display()),
            Staleness::Changed => write!(f, "signature changed"),
            Staleness::StaleChild(key) => write!(f, "generated task {key} out of date"),
            Staleness::ScanFailed => write!(f, "dependency scan failed"),
            Staleness::Forced => write!(f, "forced"),
        }
    }
}

/// Signature store
#[derive(Debug)]
pub struct SignatureStore {
    /// Store file
    path: PathBuf,
    /// Whether records are consulted and written
    enabled: bool,
    entries: BTreeMap<String, SignatureRecord>,
}

impl SignatureStore {
    /// Load the store for `build_dir`, starting empty if it cannot be read
    pub async fn load(build_dir: &Path) -> Self {
        let path = build_dir.join(STORE_FILE);
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<StoreFile>(&content) {
                Ok(file) if file.version == STORE_VERSION => file.entries,
                Ok(file) => {
                    tracing::warn!(version = file.version, "ignoring signature store with unknown version");
                    BTreeMap::new()
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt signature store");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read signature store");
                BTreeMap::new()
            }
        };

        tracing::debug!(entries = entries.len(), path = %path.display(), "loaded signature store");
        Self {
            path,
            enabled: true,
            entries,
        }
    }

    /// Create a disabled store: every task is stale, nothing is written
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            enabled: false,
            entries: BTreeMap::new(),
        }
    }

    /// Check if the store is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Identity of a task in the store: its outputs, or name and inputs
    pub fn key(task: &Task) -> String {
        if task.outputs.is_empty() {
            let inputs: Vec<_> = task.inputs.iter().map(|p| p.to_string_lossy()).collect();
            format!("task:{}:{}", task.name, inputs.join("|"))
        } else {
            let outputs: Vec<_> = task.outputs.iter().map(|p| p.to_string_lossy()).collect();
            outputs.join("|")
        }
    }

    pub fn lookup(&self, task: &Task) -> Option<&SignatureRecord> {
        self.entries.get(&Self::key(task))
    }

    /// Decide whether `task`, currently fingerprinted as `signature`, must run
    pub fn check(&self, task: &Task, signature: &Signature) -> Staleness {
        if !self.enabled {
            return Staleness::Forced;
        }

        let Some(record) = self.lookup(task) else {
            return Staleness::NoRecord;
        };

        if let Some(missing) = task.outputs.iter().find(|p| !p.exists()) {
            return Staleness::MissingOutput(missing.clone());
        }

        if record.signature != signature.to_hex() {
            return Staleness::Changed;
        }

        let mut seen = HashSet::new();
        if let Some(key) = self.stale_child(&record.children, &mut seen) {
            return Staleness::StaleChild(key);
        }

        Staleness::Fresh
    }

    /// First generated task, at any depth, that would have to run again
    fn stale_child<'a>(&'a self, keys: &'a [String], seen: &mut HashSet<&'a str>) -> Option<String> {
        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            let Some(record) = self.entries.get(key) else {
                return Some(key.clone());
            };
            if record.outputs.iter().any(|p| !p.exists())
                || signature::digest_files(&record.watched) != record.watched_digest
            {
                return Some(key.clone());
            }
            if let Some(stale) = self.stale_child(&record.children, seen) {
                return Some(stale);
            }
        }
        None
    }

    /// Record a successful execution of `task`, which generated `children`
    pub fn record(
        &mut self,
        task: &Task,
        signature: &Signature,
        duration_ms: u64,
        children: Vec<String>,
    ) {
        if !self.enabled {
            return;
        }

        let watched: Vec<PathBuf> = task
            .inputs
            .iter()
            .chain(task.dependencies())
            .cloned()
            .collect();
        self.entries.insert(
            Self::key(task),
            SignatureRecord {
                signature: signature.to_hex(),
                task: task.name.clone(),
                succeeded_at: chrono::Utc::now(),
                duration_ms,
                outputs: task.outputs.clone(),
                watched_digest: signature::digest_files(&watched),
                watched,
                children,
            },
        );
    }

    /// Drop the record of `task`, after it failed
    pub fn forget(&mut self, task: &Task) {
        self.entries.remove(&Self::key(task));
    }

    /// Write the store to disk, replacing the previous file atomically
    pub async fn flush(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = StoreFile {
            version: STORE_VERSION,
            entries: self.entries.clone(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(|e| BobError::Cache {
            message: format!("Failed to serialize signature store: {}", e),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }

    /// Drop every record, in memory and on disk
    pub async fn clear(&mut self) -> Result<()> {
        self.entries.clear();

        if self.enabled && self.path.exists() {
            tokio::fs::remove_file(&self.path).await?;
        }

        Ok(())
    }

    /// Get store statistics
    pub fn stats(&self) -> CacheStats {
        let total_size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        CacheStats {
            entries: self.entries.len(),
            total_size,
            path: self.path.clone(),
        }
    }
}

/// Store statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub path: PathBuf,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let size_str = if self.total_size < 1024 {
            format!("{} B", self.total_size)
        } else if self.total_size < 1024 * 1024 {
            format!("{:.1} KB", self.total_size as f64 / 1024.0)
        } else {
            format!("{:.1} MB", self.total_size as f64 / (1024.0 * 1024.0))
        };

        write!(
            f,
            "{} entries, {} ({})",
            self.entries,
            size_str,
            self.path.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::TaskFunction;

    fn task_writing(out: &Path) -> Task {
        Task::new("touch", TaskFunction::command(vec!["touch".into()])).outputs([out])
    }

    #[tokio::test]
    async fn test_store_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("out.o");
        std::fs::write(&out, "obj").unwrap();
        let task = task_writing(&out);
        let sig = signature::compute(&task);

        let mut store = SignatureStore::load(temp.path()).await;
        assert_eq!(store.check(&task, &sig), Staleness::NoRecord);

        store.record(&task, &sig, 5, Vec::new());
        store.flush().await.unwrap();

        let reloaded = SignatureStore::load(temp.path()).await;
        assert_eq!(reloaded.check(&task, &sig), Staleness::Fresh);
        assert_eq!(reloaded.lookup(&task).unwrap().task, "touch");
        assert_eq!(reloaded.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_missing_output_is_stale() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("gone.o");
        let task = task_writing(&out);
        let sig = signature::compute(&task);

        let mut store = SignatureStore::load(temp.path()).await;
        store.record(&task, &sig, 0, Vec::new());
        assert_eq!(store.check(&task, &sig), Staleness::MissingOutput(out));
    }

    #[tokio::test]
    async fn test_corrupt_store_loads_empty() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(STORE_FILE);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let store = SignatureStore::load(temp.path()).await;
        assert_eq!(store.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_clear_removes_file() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("out.o");
        let task = task_writing(&out);
        let sig = signature::compute(&task);

        let mut store = SignatureStore::load(temp.path()).await;
        store.record(&task, &sig, 0, Vec::new());
        store.flush().await.unwrap();
        assert!(temp.path().join(STORE_FILE).exists());

        store.clear().await.unwrap();
        assert!(!temp.path().join(STORE_FILE).exists());
        assert!(store.lookup(&task).is_none());
    }

    #[test]
    fn test_disabled_store_forces_everything() {
        let task = task_writing(Path::new("x.o"));
        let sig = signature::compute(&task);
        assert_eq!(SignatureStore::disabled().check(&task, &sig), Staleness::Forced);
    }

    #[tokio::test]
    async fn test_parent_is_stale_when_a_child_is() {
        let temp = tempfile::tempdir().unwrap();
        let manifest = temp.path().join("list.dynamic");
        let child_in = temp.path().join("a.number");
        let child_out = temp.path().join("a.numberc");
        for path in [&manifest, &child_in, &child_out] {
            std::fs::write(path, "1").unwrap();
        }

        let parent = Task::new("expand", TaskFunction::command(vec!["true".into()])).inputs([&manifest]);
        let child = Task::new("mul", TaskFunction::command(vec!["true".into()]))
            .inputs([&child_in])
            .outputs([&child_out]);
        let (parent_sig, child_sig) = (signature::compute(&parent), signature::compute(&child));

        let mut store = SignatureStore::load(temp.path()).await;
        store.record(&parent, &parent_sig, 0, vec![SignatureStore::key(&child)]);
        assert!(matches!(store.check(&parent, &parent_sig), Staleness::StaleChild(_)));

        store.record(&child, &child_sig, 0, Vec::new());
        assert_eq!(store.check(&parent, &parent_sig), Staleness::Fresh);

        std::fs::write(&child_in, "2").unwrap();
        assert!(matches!(store.check(&parent, &parent_sig), Staleness::StaleChild(_)));
        std::fs::write(&child_in, "1").unwrap();

        std::fs::remove_file(&child_out).unwrap();
        assert!(matches!(store.check(&parent, &parent_sig), Staleness::StaleChild(_)));
        std::fs::write(&child_out, "1").unwrap();

        store.forget(&child);
        assert!(matches!(store.check(&parent, &parent_sig), Staleness::StaleChild(_)));
    }
}
