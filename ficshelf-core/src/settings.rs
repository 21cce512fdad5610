//! User settings
//!
//! Settings are held by an explicit [`SettingsService`] that callers create
//! and pass around; where they are stored is decided by the injected
//! [`SettingsBackend`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::BackendType;
use crate::error::{CatalogError, Result};
use crate::import::ImportOptions;
use crate::storage::JsonFile;
use crate::versioned::VersionedJson;

/// Current schema version of `settings.json`
pub const SETTINGS_VERSION: u32 = 1;

/// Environment variable overriding the settings file location
pub const SETTINGS_ENV: &str = "FICSHELF_SETTINGS";

const APP_DIR: &str = "ficshelf";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Archive root; the platform data directory when unset
    pub archive_dir: Option<PathBuf>,
    /// Storage backend; inferred from the archive contents when unset
    pub backend: Option<BackendType>,
    /// Pause between sequential imports, in milliseconds
    pub import_delay_ms: u64,
    /// Remember tag names resolved during import
    pub auto_update_mappings: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            archive_dir: None,
            backend: None,
            import_delay_ms: 1_000,
            auto_update_mappings: true,
        }
    }
}

impl Settings {
    /// The configured archive root, or `<data dir>/ficshelf`
    pub fn archive_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.archive_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or_else(|| CatalogError::Storage("could not determine data directory".to_string()))
    }

    pub fn import_options(&self) -> ImportOptions {
        ImportOptions {
            delay: Duration::from_millis(self.import_delay_ms),
            update_mappings: self.auto_update_mappings,
        }
    }
}

/// Where settings are persisted
pub trait SettingsBackend: Send + Sync {
    fn load(&self) -> Result<Settings>;

    fn save(&self, settings: &Settings) -> Result<()>;
}

/// Settings stored as versioned JSON in a single file
pub struct FileSettingsBackend {
    file: JsonFile,
    codec: VersionedJson<Settings>,
}

impl FileSettingsBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: JsonFile::new(path),
            codec: VersionedJson::new(SETTINGS_VERSION, Vec::new())?,
        })
    }

    /// Backend at [`settings_path`]
    pub fn at_default_location() -> Result<Self> {
        Self::new(settings_path()?)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl SettingsBackend for FileSettingsBackend {
    fn load(&self) -> Result<Settings> {
        Ok(self.file.load(&self.codec)?.unwrap_or_default())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        self.file.save(&self.codec, settings)
    }
}

/// Location of the settings file: `$FICSHELF_SETTINGS`, or
/// `<config dir>/ficshelf/settings.json`
pub fn settings_path() -> Result<PathBuf> {
    resolve_settings_path(std::env::var_os(SETTINGS_ENV), dirs::config_dir())
}

fn resolve_settings_path(env: Option<OsString>, config_dir: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = env.filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    config_dir
        .map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
        .ok_or_else(|| CatalogError::Storage("could not determine config directory".to_string()))
}

/// Cached settings backed by a [`SettingsBackend`]
pub struct SettingsService {
    backend: Box<dyn SettingsBackend>,
    current: RwLock<Settings>,
}

impl SettingsService {
    pub fn new(backend: Box<dyn SettingsBackend>) -> Result<Self> {
        let current = backend.load()?;
        Ok(Self {
            backend,
            current: RwLock::new(current),
        })
    }

    /// A copy of the current settings
    pub fn get(&self) -> Settings {
        match self.current.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-reads the settings from the backend
    pub fn reload(&self) -> Result<Settings> {
        let loaded = self.backend.load()?;
        let mut current = self
            .current
            .write()
            .map_err(|_| CatalogError::poisoned("settings"))?;
        *current = loaded.clone();
        Ok(loaded)
    }

    /// Applies `f`, persists the result and makes it current. Nothing changes
    /// when saving fails.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let mut current = self
            .current
            .write()
            .map_err(|_| CatalogError::poisoned("settings"))?;
        let mut updated = current.clone();
        f(&mut updated);
        if updated != *current {
            self.backend.save(&updated)?;
            *current = updated.clone();
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let backend = FileSettingsBackend::new(dir.path().join("settings.json")).unwrap();
        let service = SettingsService::new(Box::new(backend)).unwrap();

        let settings = service.get();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.import_options().delay, Duration::from_secs(1));
    }

    #[test]
    fn test_update_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let service =
            SettingsService::new(Box::new(FileSettingsBackend::new(&path).unwrap())).unwrap();

        let updated = service
            .update(|s| {
                s.backend = Some(BackendType::Sqlite);
                s.archive_dir = Some(dir.path().join("archive"));
            })
            .unwrap();
        assert_eq!(service.get(), updated);
        assert_eq!(updated.archive_dir().unwrap(), dir.path().join("archive"));

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"#version\": 1"));
        assert!(raw.contains("\"sqlite\""));

        let other =
            SettingsService::new(Box::new(FileSettingsBackend::new(&path).unwrap())).unwrap();
        assert_eq!(other.get().backend, Some(BackendType::Sqlite));

        other.update(|s| s.import_delay_ms = 0).unwrap();
        assert_eq!(service.get().import_delay_ms, 1_000);
        assert_eq!(service.reload().unwrap().import_delay_ms, 0);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r##"{"#version": 1, "auto_update_mappings": false}"##).unwrap();

        let settings = FileSettingsBackend::new(&path).unwrap().load().unwrap();
        assert!(!settings.auto_update_mappings);
        assert_eq!(settings.import_delay_ms, 1_000);
    }

    struct FailingBackend(Mutex<Settings>);

    impl SettingsBackend for FailingBackend {
        fn load(&self) -> Result<Settings> {
            Ok(self.0.lock().unwrap().clone())
        }

        fn save(&self, _settings: &Settings) -> Result<()> {
            Err(CatalogError::Storage("read-only".to_string()))
        }
    }

    #[test]
    fn test_failed_save_keeps_current_value() {
        let service =
            SettingsService::new(Box::new(FailingBackend(Mutex::new(Settings::default()))))
                .unwrap();
        assert!(service.update(|s| s.import_delay_ms = 5).is_err());
        assert_eq!(service.get().import_delay_ms, 1_000);
    }

    #[test]
    fn test_settings_path_resolution() {
        let config = PathBuf::from("/home/reader/.config");
        assert_eq!(
            resolve_settings_path(None, Some(config.clone())).unwrap(),
            config.join("ficshelf").join("settings.json")
        );
        assert_eq!(
            resolve_settings_path(Some(OsString::from("/tmp/custom.json")), Some(config)).unwrap(),
            PathBuf::from("/tmp/custom.json")
        );
        assert!(resolve_settings_path(Some(OsString::new()), None).is_err());
    }
}
