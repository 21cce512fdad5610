//! Tag-name mapping cache
//!
//! Remembers which tag a free-text name (as scraped by an importer) was
//! mapped to, keyed by the normalized name. The cache is an accelerator,
//! not a source of truth: cached ids may point at deleted tags and are
//! re-validated on every lookup, and saving happens on a background writer
//! thread whose failures are only logged.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use crate::db::TagRepository;
use crate::error::{CatalogError, Result};
use crate::models::{Tag, TagId};
use crate::storage::JsonFile;
use crate::versioned::VersionedJson;

/// Current schema version of `tag_mappings.json`
pub const MAPPINGS_VERSION: u32 = 1;

/// Lowercased, trimmed form used as the cache key
pub fn normalize_tag_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MappingFile {
    #[serde(default)]
    mappings: BTreeMap<String, TagId>,
}

type Mappings = BTreeMap<String, TagId>;

/// Commands handled by the writer thread, in order
enum WriterCommand {
    /// Persist the current mappings
    Save,
    /// Acknowledge once every earlier command has been handled
    Flush(mpsc::Sender<()>),
    /// Stop the writer thread
    Stop,
}

/// Persistent `normalized name -> tag id` cache
pub struct TagMappingCache {
    path: PathBuf,
    mappings: Arc<Mutex<Mappings>>,
    /// Serializes every load and save of the backing file
    file: Arc<Mutex<JsonFile>>,
    codec: Arc<VersionedJson<MappingFile>>,
    command_tx: mpsc::Sender<WriterCommand>,
    writer: Option<JoinHandle<()>>,
}

impl TagMappingCache {
    /// Opens the cache file at `path`. A missing file yields an empty cache.
    ///
    /// A file that cannot be decoded (corrupt, or written by a newer version)
    /// is moved aside to `<name>.bak` and the cache starts empty, so later
    /// saves never overwrite it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let codec: VersionedJson<MappingFile> = VersionedJson::new(MAPPINGS_VERSION, Vec::new())?;
        let file = JsonFile::new(&path);

        let initial = match file.load(&codec) {
            Ok(loaded) => loaded.unwrap_or_default().mappings,
            Err(e @ (CatalogError::Migration(_) | CatalogError::Json(_))) => {
                let backup = set_aside(&path)?;
                log::warn!(
                    "unreadable tag mappings {:?} moved to {:?}: {}",
                    path,
                    backup,
                    e
                );
                Mappings::new()
            }
            Err(e) => return Err(e),
        };
        log::debug!("loaded {} tag mapping(s) from {:?}", initial.len(), path);

        let mappings = Arc::new(Mutex::new(initial));
        let file = Arc::new(Mutex::new(file));
        let codec = Arc::new(codec);
        let (command_tx, command_rx) = mpsc::channel();

        let thread_mappings = Arc::clone(&mappings);
        let thread_file = Arc::clone(&file);
        let thread_codec = Arc::clone(&codec);
        let writer = thread::spawn(move || {
            writer_thread(thread_mappings, thread_file, thread_codec, command_rx);
        });

        Ok(Self {
            path,
            mappings,
            file,
            codec,
            command_tx,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Mappings>> {
        self.mappings
            .lock()
            .map_err(|_| CatalogError::poisoned("tag mappings"))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cached id for `name`, without checking that the tag still exists
    pub fn cached(&self, name: &str) -> Option<TagId> {
        self.lock()
            .ok()
            .and_then(|m| m.get(&normalize_tag_name(name)).copied())
    }

    /// Maps each name to an existing tag.
    ///
    /// A cached id counts only while its tag exists; otherwise the name is
    /// matched against the live tag names (case-insensitively, preferring an
    /// exact match). Names that resolve neither way are left out.
    pub fn map_tags<R, I, S>(&self, tags: &R, names: I) -> Result<BTreeMap<String, TagId>>
    where
        R: TagRepository + ?Sized,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = names
            .into_iter()
            .map(|n| n.as_ref().to_string())
            .filter(|n| !n.trim().is_empty())
            .collect();

        let cached: Mappings = {
            let mappings = self.lock()?;
            names
                .iter()
                .filter_map(|n| {
                    mappings
                        .get(&normalize_tag_name(n))
                        .map(|id| (n.clone(), *id))
                })
                .collect()
        };
        let candidates: BTreeSet<TagId> = cached.values().copied().collect();
        let live = tags.existing_tags(&candidates)?;

        let mut resolved = BTreeMap::new();
        let mut misses = Vec::new();
        for name in names {
            match cached.get(&name) {
                Some(id) if live.contains(id) => {
                    resolved.insert(name, *id);
                }
                _ => misses.push(name),
            }
        }

        if !misses.is_empty() {
            let all_tags = tags.list_tags()?;
            let mut by_name: BTreeMap<String, Vec<&Tag>> = BTreeMap::new();
            for tag in &all_tags {
                by_name
                    .entry(normalize_tag_name(tag.name()))
                    .or_default()
                    .push(tag);
            }
            for name in misses {
                let Some(candidates) = by_name.get(&normalize_tag_name(&name)) else {
                    log::debug!("no tag matches '{}'", name);
                    continue;
                };
                let exact = candidates.iter().find(|t| t.name() == name.trim());
                if let Some(tag) = exact.or(candidates.first()) {
                    resolved.insert(name, tag.id());
                }
            }
        }

        Ok(resolved)
    }

    /// Merges entries that point at existing tags and schedules a save.
    ///
    /// Returns how many entries were merged. The save runs on the writer
    /// thread; call [`flush`](Self::flush) to wait for it.
    pub fn update_mappings<R>(&self, tags: &R, mapping: &BTreeMap<String, TagId>) -> Result<usize>
    where
        R: TagRepository + ?Sized,
    {
        let ids: BTreeSet<TagId> = mapping.values().copied().collect();
        let live = tags.existing_tags(&ids)?;

        let mut merged = 0;
        {
            let mut mappings = self.lock()?;
            for (name, id) in mapping {
                let key = normalize_tag_name(name);
                if key.is_empty() || !live.contains(id) {
                    log::debug!("not caching mapping '{}' -> {}", name, id);
                    continue;
                }
                mappings.insert(key, *id);
                merged += 1;
            }
        }

        if merged > 0 && self.command_tx.send(WriterCommand::Save).is_err() {
            log::warn!("tag mapping writer has stopped; mappings kept in memory only");
        }
        Ok(merged)
    }

    /// Blocks until every save scheduled so far has finished
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.command_tx.send(WriterCommand::Flush(ack_tx)).is_err() || ack_rx.recv().is_err() {
            log::warn!("tag mapping writer has stopped; nothing to flush");
        }
    }

    /// Replaces the in-memory mappings with the file contents, after
    /// pending saves have been written
    pub fn reload(&self) -> Result<()> {
        self.flush();
        let loaded = {
            let file = self
                .file
                .lock()
                .map_err(|_| CatalogError::poisoned("tag mappings file"))?;
            file.load(self.codec.as_ref())?.unwrap_or_default().mappings
        };
        *self.lock()? = loaded;
        Ok(())
    }
}

impl Drop for TagMappingCache {
    fn drop(&mut self) {
        // Pending saves are handled before the stop command
        let _ = self.command_tx.send(WriterCommand::Stop);

        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

/// Renames `path` to the first free `<name>.bak`, `<name>.bak.2`, ...
fn set_aside(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tag_mappings.json".to_string());
    let mut backup = path.with_file_name(format!("{}.bak", name));
    let mut n = 2;
    while backup.exists() {
        backup = path.with_file_name(format!("{}.bak.{}", name, n));
        n += 1;
    }
    fs::rename(path, &backup)?;
    Ok(backup)
}

fn writer_thread(
    mappings: Arc<Mutex<Mappings>>,
    file: Arc<Mutex<JsonFile>>,
    codec: Arc<VersionedJson<MappingFile>>,
    command_rx: mpsc::Receiver<WriterCommand>,
) {
    while let Ok(command) = command_rx.recv() {
        match command {
            WriterCommand::Save => {
                let snapshot = match mappings.lock() {
                    Ok(m) => MappingFile {
                        mappings: m.clone(),
                    },
                    Err(_) => {
                        log::warn!("tag mappings lock poisoned; skipping save");
                        continue;
                    }
                };
                let result = match file.lock() {
                    Ok(file) => file.save(codec.as_ref(), &snapshot),
                    Err(_) => Err(CatalogError::poisoned("tag mappings file")),
                };
                match result {
                    Ok(()) => log::debug!("saved {} tag mapping(s)", snapshot.mappings.len()),
                    Err(e) => log::warn!("failed to save tag mappings: {}", e),
                }
            }
            WriterCommand::Flush(ack) => {
                let _ = ack.send(());
            }
            WriterCommand::Stop => break,
        }
    }
}
