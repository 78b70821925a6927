//! Content-addressed seed store with an in-memory file cache.
//!
//! On disk: `corpus/<fork>/<object>/<hex(sha256(payload))>.ssz`. The
//! store is append-only and idempotent: depositing the same payload
//! twice resolves to the same path. Sampling is deterministic: the same
//! `(fork, object, seed)` always returns the same entry.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors from corpus sampling and deposits.
#[derive(Debug, Error)]
pub enum CorpusError {
    /// No entries exist for `(fork, object)`. Recoverable: the dispatch
    /// loop logs and moves to the next seed.
    #[error("no corpus entries for {fork}/{object}")]
    EmptyCategory { fork: String, object: String },

    #[error("corpus I/O at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// The on-disk store plus the unbounded read cache.
///
/// The cache memoizes file contents by path under a single lock;
/// corpora are bounded and seed files are small, so eviction is not
/// worth its complexity for a fuzzing run. The store is an explicit
/// value threaded to its users, not process-global state.
pub struct CorpusStore {
    root: PathBuf,
    cache: Mutex<BTreeMap<PathBuf, Arc<Vec<u8>>>>,
}

impl CorpusStore {
    /// Open a store rooted at `root`. No I/O happens until the first
    /// deposit or sample.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministically sample one entry from `(fork, object)`.
    ///
    /// The entry at index `seed mod N` of the sorted file listing is
    /// returned, so seeds revisit the category round-robin and any
    /// finding can be regenerated from its seed.
    pub fn get(&self, fork: &str, object: &str, seed: u64) -> Result<Arc<Vec<u8>>, CorpusError> {
        let dir = self.root.join(fork).join(object);
        let files = list_files(&dir).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => CorpusError::EmptyCategory {
                fork: fork.to_string(),
                object: object.to_string(),
            },
            _ => CorpusError::Io {
                path: dir.clone(),
                source,
            },
        })?;
        if files.is_empty() {
            return Err(CorpusError::EmptyCategory {
                fork: fork.to_string(),
                object: object.to_string(),
            });
        }
        let index = (seed % files.len() as u64) as usize;
        self.read_cached(dir.join(&files[index]))
    }

    /// Deposit `payload` under its canonical content-addressed path and
    /// return that path. Re-depositing identical bytes is a no-op.
    pub fn deposit(
        &self,
        fork: &str,
        object: &str,
        payload: &[u8],
    ) -> Result<PathBuf, CorpusError> {
        let dir = self.root.join(fork).join(object);
        fs::create_dir_all(&dir).map_err(|source| CorpusError::Io {
            path: dir.clone(),
            source,
        })?;
        let name = format!("{}.ssz", hex::encode(Sha256::digest(payload)));
        let path = dir.join(name);
        if path.exists() {
            return Ok(path);
        }
        // Write-then-rename so a crashed deposit never leaves a partial
        // .ssz file behind for the sampler to pick up.
        let io_err = |source| CorpusError::Io {
            path: path.clone(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(payload).map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(path)
    }

    fn read_cached(&self, path: PathBuf) -> Result<Arc<Vec<u8>>, CorpusError> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(data) = cache.get(&path) {
            return Ok(Arc::clone(data));
        }
        let data = fs::read(&path).map_err(|source| CorpusError::Io {
            path: path.clone(),
            source,
        })?;
        let data = Arc::new(data);
        cache.insert(path, Arc::clone(&data));
        Ok(data)
    }
}

/// Regular files in `dir`, sorted by name. Subdirectories are ignored.
fn list_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}
