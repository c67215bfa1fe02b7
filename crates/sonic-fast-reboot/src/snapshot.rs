//! Filtered durable snapshot of the forwarding state database.
//!
//! Ordering is filter, persist, verify, relocate, clear source. The durable
//! file only ever receives a dump that was re-read and found free of
//! excluded keys, and it is not considered complete until its manifest has
//! been written next to it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SnapshotConfig;
use crate::context::RebootContext;
use crate::error::SnapshotError;
use crate::state_db::{StateStore, StoreDump};

/// Filter/persist rounds tried before giving up on a concurrent writer.
pub const MAX_FILTER_ATTEMPTS: u32 = 3;

/// Suffix of the manifest written next to a complete snapshot.
pub const MANIFEST_SUFFIX: &str = ".meta.json";

/// Label of a snapshot found without its manifest during recovery.
pub const PARTIAL_LABEL: &str = "partial";

/// Label of a complete snapshot from an attempt that did not hand off.
pub const ABORTED_LABEL: &str = "aborted";

/// Allow-list of key namespaces.
///
/// A key belongs to a namespace when it equals the namespace or starts with
/// it followed by `:` or `|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceFilter {
    namespaces: Vec<String>,
}

impl NamespaceFilter {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
        }
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Returns true if `key` belongs to an allowed namespace.
    pub fn allows(&self, key: &str) -> bool {
        self.namespaces.iter().any(|ns| match key.strip_prefix(ns.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with(':') || rest.starts_with('|'),
            None => false,
        })
    }

    /// Keys from `keys` outside every allowed namespace.
    pub fn excluded<'a, I>(&self, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        keys.into_iter()
            .filter(|k| !self.allows(k))
            .cloned()
            .collect()
    }
}

/// Metadata written next to a complete snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Dump format version.
    pub version: u32,
    /// Source database.
    pub db: String,
    /// Time the source was persisted.
    pub saved_at: String,
    /// Keys in the snapshot.
    pub key_count: usize,
    /// Namespaces the snapshot was filtered to.
    pub namespaces: Vec<String>,
    /// Filter/persist rounds it took.
    pub attempts: u32,
}

/// A complete durable snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    /// Durable snapshot file.
    pub path: PathBuf,
    /// Manifest file.
    pub manifest: PathBuf,
    /// Keys in the snapshot.
    pub key_count: usize,
}

/// Takes snapshots of one source store into a durable directory.
pub struct StateSnapshotStore {
    source: Arc<dyn StateStore>,
    directory: PathBuf,
    file_name: String,
    max_rotated: usize,
}

impl StateSnapshotStore {
    pub fn new(source: Arc<dyn StateStore>, config: &SnapshotConfig) -> Self {
        Self {
            source,
            directory: config.directory.clone(),
            file_name: config.file_name.clone(),
            max_rotated: config.max_rotated,
        }
    }

    /// Durable snapshot path.
    pub fn durable_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    /// Snapshots the source, keeping only keys in `allowed_namespaces`.
    ///
    /// On success the source store has been flushed. On failure the durable
    /// path holds either nothing new or a file recorded in `ctx` as pending.
    pub async fn snapshot(
        &self,
        allowed_namespaces: &[String],
        ctx: &mut RebootContext,
    ) -> Result<SnapshotHandle, SnapshotError> {
        let filter = NamespaceFilter::new(allowed_namespaces.iter().cloned());
        let (dump_path, dump, attempts) = self.filter_and_persist(&filter).await?;

        fs::create_dir_all(&self.directory).map_err(|e| SnapshotError::io(&self.directory, e))?;
        self.rotate_previous()?;

        let durable = self.durable_path();
        ctx.mark_snapshot_pending(durable.clone());
        relocate(&dump_path, &durable)?;

        let manifest = SnapshotManifest {
            version: dump.version,
            db: dump.db.clone(),
            saved_at: dump.saved_at.clone(),
            key_count: dump.entries.len(),
            namespaces: filter.namespaces().to_vec(),
            attempts,
        };
        let manifest_path = manifest_path(&durable);
        write_manifest(&manifest_path, &manifest)?;

        let handle = SnapshotHandle {
            path: durable,
            manifest: manifest_path,
            key_count: manifest.key_count,
        };
        ctx.complete_snapshot(handle.clone());

        self.source.flush().await?;
        info!(
            db = %self.source.name(),
            path = %handle.path.display(),
            keys = handle.key_count,
            attempts,
            "State snapshot complete"
        );
        Ok(handle)
    }

    /// Deletes excluded keys and persists, until the dump is clean.
    async fn filter_and_persist(
        &self,
        filter: &NamespaceFilter,
    ) -> Result<(PathBuf, StoreDump, u32), SnapshotError> {
        let mut leftover = Vec::new();
        for attempt in 1..=MAX_FILTER_ATTEMPTS {
            let keys = self.source.keys().await?;
            let excluded = filter.excluded(&keys);
            if !excluded.is_empty() {
                let removed = self.source.del(&excluded).await?;
                debug!(db = %self.source.name(), removed, attempt, "Removed excluded keys");
            }

            let dump_path = self.source.persist().await?;
            let dump = StoreDump::read_from(&dump_path)?;
            leftover = filter.excluded(dump.entries.keys());
            if leftover.is_empty() {
                return Ok((dump_path, dump, attempt));
            }

            warn!(
                db = %self.source.name(),
                attempt,
                keys = leftover.len(),
                "Excluded keys reappeared in persisted dump"
            );
            if let Err(e) = fs::remove_file(&dump_path) {
                debug!(path = %dump_path.display(), error = %e, "Failed to remove rejected dump");
            }
        }

        Err(SnapshotError::Contaminated {
            attempts: MAX_FILTER_ATTEMPTS,
            keys: leftover,
        })
    }

    /// Moves an existing durable snapshot aside with a timestamp suffix.
    fn rotate_previous(&self) -> Result<(), SnapshotError> {
        let durable = self.durable_path();
        if durable.exists() {
            let rotated = preserve(&durable, None)?;
            info!(path = %rotated.display(), "Rotated previous snapshot");
        }
        for label in [None, Some(PARTIAL_LABEL), Some(ABORTED_LABEL)] {
            self.cleanup_rotated(label);
        }
        Ok(())
    }

    /// Removes all but the newest `max_rotated` snapshots carrying `label`.
    fn cleanup_rotated(&self, label: Option<&str>) {
        let mut rotated = match self.rotated_snapshots(label) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(dir = %self.directory.display(), error = %e, "Failed to list rotated snapshots");
                return;
            }
        };
        if rotated.len() <= self.max_rotated {
            return;
        }

        // Timestamp suffixes sort chronologically; newest first.
        rotated.sort();
        rotated.reverse();
        for path in &rotated[self.max_rotated..] {
            for file in [path.clone(), manifest_path(path)] {
                match fs::remove_file(&file) {
                    Ok(()) => debug!(path = %file.display(), "Removed old snapshot"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %file.display(), error = %e, "Failed to remove old snapshot"),
                }
            }
        }
    }

    /// Snapshot files named `<file>[.<label>].<timestamp>`, excluding manifests.
    pub fn rotated_snapshots(&self, label: Option<&str>) -> io::Result<Vec<PathBuf>> {
        let prefix = match label {
            Some(label) => format!("{}.{}.", self.file_name, label),
            None => format!("{}.", self.file_name),
        };
        let mut paths = Vec::new();
        if !self.directory.exists() {
            return Ok(paths);
        }
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            let is_timestamp = suffix.starts_with(|c: char| c.is_ascii_digit());
            if is_timestamp && !suffix.ends_with(MANIFEST_SUFFIX) {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

/// Manifest path of a snapshot file.
pub fn manifest_path(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.as_os_str().to_os_string();
    name.push(MANIFEST_SUFFIX);
    PathBuf::from(name)
}

/// Renames a snapshot (and its manifest, if any) to
/// `<file>[.<label>].<timestamp>` and returns the new snapshot path.
pub fn preserve(snapshot: &Path, label: Option<&str>) -> Result<PathBuf, SnapshotError> {
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6f");
    let suffix = match label {
        Some(label) => format!("{}.{}", label, timestamp),
        None => timestamp.to_string(),
    };

    let mut target = snapshot.as_os_str().to_os_string();
    target.push(format!(".{}", suffix));
    let target = PathBuf::from(target);

    fs::rename(snapshot, &target).map_err(|e| SnapshotError::io(snapshot, e))?;

    let manifest = manifest_path(snapshot);
    if manifest.exists() {
        let manifest_target = manifest_path(&target);
        fs::rename(&manifest, &manifest_target).map_err(|e| SnapshotError::io(&manifest, e))?;
    }
    Ok(target)
}

/// Moves `from` to `to`, copying when they are on different filesystems.
fn relocate(from: &Path, to: &Path) -> Result<(), SnapshotError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| SnapshotError::io(to, e))?;
    fs::remove_file(from).map_err(|e| SnapshotError::io(from, e))
}

fn write_manifest(path: &Path, manifest: &SnapshotManifest) -> Result<(), SnapshotError> {
    let json =
        serde_json::to_vec_pretty(manifest).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json).map_err(|e| SnapshotError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| SnapshotError::io(path, e))
}
