//! # Content-Addressed File Store
//!
//! Every referenced file is stored once per node as a blob keyed by the
//! SHA-1 of its body, under two-level hex-prefix directories. A named-path
//! mirror under `workspace/` tracks what each registered path currently
//! points at, so `ls` can classify working files as in-sync, outdated or
//! untracked. Blob writes are atomic (write-then-rename).
//!
//! Cross-node resolution lives above this module: the node asks peers for
//! a missing blob and hands the bytes to [`FileStore::store_fetched`],
//! which re-hashes and rejects mismatches.

use crate::term::{sha1_hex, FileRef};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("no blob stored for {0}")]
    UnknownBlob(String),

    #[error("integrity mismatch for {path}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// `ls` classification of a workspace directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LsReport {
    pub dirs: Vec<String>,
    pub in_sync: Vec<String>,
    pub outdated: Vec<String>,
    pub untracked: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PathIndex {
    paths: BTreeMap<String, String>,
}

/// The per-node blob store plus named-path mirror.
pub struct FileStore {
    root: PathBuf,
    index: Mutex<PathIndex>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("workspace"))?;
        fs::create_dir_all(root.join("scratch"))?;
        let index_path = root.join("paths.json");
        let index = if index_path.exists() {
            serde_json::from_str(&fs::read_to_string(&index_path)?)?
        } else {
            PathIndex::default()
        };
        Ok(FileStore {
            root,
            index: Mutex::new(index),
        })
    }

    fn blob_path(&self, sha1: &str) -> PathBuf {
        self.root
            .join("blobs")
            .join(&sha1[..2])
            .join(&sha1[2..4])
            .join(sha1)
    }

    fn valid_digest(sha1: &str) -> bool {
        sha1.len() == 40 && sha1.bytes().all(|b| b.is_ascii_hexdigit())
    }

    fn workspace(&self) -> PathBuf {
        self.root.join("workspace")
    }

    /// Reject absolute paths and parent traversal in client-supplied
    /// destination paths.
    fn checked_rel(&self, path: &str) -> StoreResult<PathBuf> {
        let rel = Path::new(path);
        if rel.components().any(|c| {
            !matches!(c, Component::Normal(_) | Component::CurDir)
        }) {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(self.workspace().join(rel))
    }

    /// Atomically write `bytes` at `dest` via a temp file and rename.
    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> StoreResult<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self
            .root
            .join("scratch")
            .join(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, dest)?;
        Ok(())
    }

    /// Store `bytes` under `dest_path`, returning its reference. The blob
    /// is written once; the workspace mirror and path index are updated.
    pub fn put(&self, bytes: &[u8], dest_path: &str) -> StoreResult<FileRef> {
        let sha1 = sha1_hex(bytes);
        let blob = self.blob_path(&sha1);
        if !blob.exists() {
            self.write_atomic(&blob, bytes)?;
        }
        let mirror = self.checked_rel(dest_path)?;
        self.write_atomic(&mirror, bytes)?;
        self.index
            .lock()
            .paths
            .insert(dest_path.to_string(), sha1.clone());
        self.save_index()?;
        debug!(path = dest_path, %sha1, "stored blob");
        Ok(FileRef {
            file: dest_path.to_string(),
            sha1,
        })
    }

    /// Read the blob of a known reference. Fails when the blob is not
    /// stored on this node.
    pub fn get(&self, fr: &FileRef) -> StoreResult<Vec<u8>> {
        if !Self::valid_digest(&fr.sha1) {
            return Err(StoreError::UnknownBlob(fr.to_string()));
        }
        let blob = self.blob_path(&fr.sha1);
        if !blob.exists() {
            return Err(StoreError::UnknownBlob(fr.to_string()));
        }
        Ok(fs::read(blob)?)
    }

    pub fn has(&self, sha1: &str) -> bool {
        Self::valid_digest(sha1) && self.blob_path(sha1).exists()
    }

    /// Store bytes fetched from a peer, verifying them against the
    /// reference they were requested for. A mismatch is fatal for the
    /// fetch; nothing is written.
    pub fn store_fetched(&self, fr: &FileRef, bytes: &[u8]) -> StoreResult<()> {
        let actual = sha1_hex(bytes);
        if actual != fr.sha1 {
            return Err(StoreError::IntegrityMismatch {
                path: fr.file.clone(),
                expected: fr.sha1.clone(),
                actual,
            });
        }
        let blob = self.blob_path(&fr.sha1);
        if !blob.exists() {
            self.write_atomic(&blob, bytes)?;
        }
        Ok(())
    }

    /// Copy a blob into `dir` under the reference's base name, for a tool
    /// invocation. Returns the materialised path.
    pub fn materialize(&self, fr: &FileRef, dir: &Path) -> StoreResult<PathBuf> {
        let bytes = self.get(fr)?;
        let name = Path::new(&fr.file)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| fr.sha1.clone());
        let dest = dir.join(name);
        fs::create_dir_all(dir)?;
        fs::write(&dest, bytes)?;
        Ok(dest)
    }

    /// A fresh per-invocation scratch directory.
    pub fn scratch_dir(&self) -> StoreResult<PathBuf> {
        let dir = self.root.join("scratch").join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Classify the entries of a workspace directory against the path
    /// index.
    pub fn ls(&self, dir: &str) -> StoreResult<LsReport> {
        let base = if dir.is_empty() || dir == "." {
            self.workspace()
        } else {
            self.checked_rel(dir)?
        };
        let mut report = LsReport::default();
        if !base.exists() {
            return Ok(report);
        }
        let index = self.index.lock();
        for entry in fs::read_dir(&base)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = if dir.is_empty() || dir == "." {
                name.clone()
            } else {
                format!("{}/{name}", dir.trim_end_matches('/'))
            };
            if entry.file_type()?.is_dir() {
                report.dirs.push(rel);
                continue;
            }
            let body = fs::read(entry.path())?;
            match index.paths.get(&rel) {
                Some(expected) if *expected == sha1_hex(&body) => report.in_sync.push(rel),
                Some(_) => report.outdated.push(rel),
                None => report.untracked.push(rel),
            }
        }
        report.dirs.sort();
        report.in_sync.sort();
        report.outdated.sort();
        report.untracked.sort();
        Ok(report)
    }

    fn save_index(&self) -> StoreResult<()> {
        let text = serde_json::to_string_pretty(&*self.index.lock())?;
        self.write_atomic(&self.root.join("paths.json"), text.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (FileStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        (store, tmp)
    }

    #[test]
    fn test_put_get_round_trip() {
        let (store, _tmp) = open();
        let fr = store.put(b"hello world", "docs/hello.txt").unwrap();
        assert_eq!(fr.file, "docs/hello.txt");
        assert_eq!(fr.sha1, sha1_hex(b"hello world"));
        assert_eq!(store.get(&fr).unwrap(), b"hello world");
    }

    #[test]
    fn test_identical_bodies_share_a_blob() {
        let (store, _tmp) = open();
        let a = store.put(b"same", "a.txt").unwrap();
        let b = store.put(b"same", "b.txt").unwrap();
        assert_eq!(a.sha1, b.sha1);
        assert!(store.has(&a.sha1));
    }

    #[test]
    fn test_get_unknown_blob_fails() {
        let (store, _tmp) = open();
        let fr = FileRef {
            file: "ghost.txt".into(),
            sha1: "da39a3ee5e6b4b0d3255bfef95601890afd80709".into(),
        };
        assert!(matches!(store.get(&fr), Err(StoreError::UnknownBlob(_))));
    }

    #[test]
    fn test_store_fetched_verifies_integrity() {
        let (store, _tmp) = open();
        let fr = FileRef {
            file: "x.txt".into(),
            sha1: sha1_hex(b"expected"),
        };
        assert!(matches!(
            store.store_fetched(&fr, b"tampered"),
            Err(StoreError::IntegrityMismatch { .. })
        ));
        assert!(!store.has(&fr.sha1));
        store.store_fetched(&fr, b"expected").unwrap();
        assert_eq!(store.get(&fr).unwrap(), b"expected");
    }

    #[test]
    fn test_path_traversal_rejected() {
        let (store, _tmp) = open();
        assert!(matches!(
            store.put(b"x", "../escape.txt"),
            Err(StoreError::InvalidPath(_))
        ));
        assert!(matches!(
            store.put(b"x", "/abs.txt"),
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_ls_classification() {
        let (store, tmp) = open();
        store.put(b"tracked", "synced.txt").unwrap();
        store.put(b"original", "changed.txt").unwrap();
        // Edit behind the store's back.
        fs::write(tmp.path().join("workspace/changed.txt"), b"edited").unwrap();
        fs::write(tmp.path().join("workspace/loose.txt"), b"loose").unwrap();
        fs::create_dir_all(tmp.path().join("workspace/sub")).unwrap();

        let report = store.ls("").unwrap();
        assert_eq!(report.in_sync, vec!["synced.txt"]);
        assert_eq!(report.outdated, vec!["changed.txt"]);
        assert_eq!(report.untracked, vec!["loose.txt"]);
        assert_eq!(report.dirs, vec!["sub"]);
    }

    #[test]
    fn test_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FileStore::open(tmp.path()).unwrap();
            store.put(b"persisted", "keep.txt").unwrap();
        }
        let store = FileStore::open(tmp.path()).unwrap();
        let report = store.ls("").unwrap();
        assert_eq!(report.in_sync, vec!["keep.txt"]);
    }

    #[test]
    fn test_materialize_uses_base_name() {
        let (store, tmp) = open();
        let fr = store.put(b"content", "deep/nested/tool-input.txt").unwrap();
        let dir = tmp.path().join("scratch-dir");
        let path = store.materialize(&fr, &dir).unwrap();
        assert_eq!(path.file_name().unwrap(), "tool-input.txt");
        assert_eq!(fs::read(path).unwrap(), b"content");
    }
}
