//! Locked JSON files
//!
//! Every JSON-backed record in the archive is read under a shared lock and
//! written under an exclusive lock held on a sibling `.lock` file, so a
//! second process never observes a torn write.

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{CatalogError, Result};
use crate::versioned::VersionedJson;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(100);

/// A single versioned JSON file guarded by an advisory lock file
#[derive(Debug, Clone)]
pub struct JsonFile {
    file_path: PathBuf,
    lock_file_path: PathBuf,
}

impl JsonFile {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        let lock_file_path = file_path.with_extension("json.lock");
        Self {
            file_path,
            lock_file_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn exists(&self) -> bool {
        self.file_path.exists()
    }

    /// Acquire an exclusive lock for writing; the returned handle holds it
    fn acquire_write_lock(&self) -> Result<File> {
        if let Some(parent) = self.lock_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.lock_file_path)?;

        self.wait_for(|| FileExt::try_lock_exclusive(&lock_file))?;
        Ok(lock_file)
    }

    /// Acquire a shared lock for reading, if anyone ever wrote the file
    fn acquire_read_lock(&self) -> Result<Option<File>> {
        if !self.lock_file_path.exists() {
            return Ok(None);
        }

        let lock_file = OpenOptions::new().read(true).open(&self.lock_file_path)?;
        self.wait_for(|| FileExt::try_lock_shared(&lock_file))?;
        Ok(Some(lock_file))
    }

    fn wait_for(&self, mut try_lock: impl FnMut() -> std::io::Result<()>) -> Result<()> {
        let start = Instant::now();
        loop {
            match try_lock() {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() > LOCK_TIMEOUT {
                        return Err(CatalogError::Storage(format!(
                            "timeout waiting for lock on {:?}",
                            self.file_path
                        )));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads and migrates the record; `None` when the file does not exist
    pub fn load<T: DeserializeOwned>(&self, codec: &VersionedJson<T>) -> Result<Option<T>> {
        if !self.file_path.exists() {
            return Ok(None);
        }

        let _lock = self.acquire_read_lock()?;
        let content = fs::read_to_string(&self.file_path)?;
        codec.from_str(&content).map(Some)
    }

    /// Writes the record to a temporary sibling and renames it into place
    pub fn save<T: Serialize>(&self, codec: &VersionedJson<T>, record: &T) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut lock_file = self.acquire_write_lock()?;
        let _ = writeln!(
            lock_file,
            "Locked by PID {} at {}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );

        let json = codec.to_string_pretty(record)?;
        let tmp_path = self.file_path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.file_path)?;

        log::debug!("saved {:?}", self.file_path);
        Ok(())
    }

    /// Removes the file; a missing file is ignored.
    ///
    /// The lock file stays: another process may already be waiting on it.
    pub fn remove(&self) -> Result<()> {
        let _lock = self.acquire_write_lock()?;
        match fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
