//! Versioned JSON records
//!
//! Every JSON-backed record written by the archive carries a version marker
//! (`"#version"` by default). Reading a record at an older version threads
//! the raw object through the registered migrations, in ascending target
//! order, before it is decoded with the current serde definition.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{MigrationError, Result};

/// Default name of the version marker property
pub const DEFAULT_VERSION_KEY: &str = "#version";

type Transform = Box<dyn Fn(&mut Map<String, Value>) -> anyhow::Result<()> + Send + Sync>;

/// A single schema step that lifts a raw record to `target_version`
pub struct Migration {
    target_version: u32,
    transform: Transform,
}

impl Migration {
    pub fn new<F>(target_version: u32, transform: F) -> Self
    where
        F: Fn(&mut Map<String, Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            target_version,
            transform: Box::new(transform),
        }
    }

    pub fn target_version(&self) -> u32 {
        self.target_version
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("target_version", &self.target_version)
            .finish_non_exhaustive()
    }
}

/// Builder for [`VersionedJson`]; the migration chain is checked in `build`
pub struct VersionedJsonBuilder<T> {
    current_version: u32,
    default_version: u32,
    version_key: String,
    migrations: Vec<Migration>,
    _record: PhantomData<fn() -> T>,
}

impl<T> VersionedJsonBuilder<T> {
    /// Name of the marker property (defaults to `#version`)
    pub fn version_key(mut self, key: impl Into<String>) -> Self {
        self.version_key = key.into();
        self
    }

    /// Version assumed for records that carry no marker (defaults to 0)
    pub fn default_version(mut self, version: u32) -> Self {
        self.default_version = version;
        self
    }

    pub fn migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    pub fn build(mut self) -> Result<VersionedJson<T>, MigrationError> {
        self.migrations.sort_by_key(Migration::target_version);

        for pair in self.migrations.windows(2) {
            if pair[0].target_version == pair[1].target_version {
                return Err(MigrationError::DuplicateTarget(pair[0].target_version));
            }
        }

        if let Some(last) = self.migrations.last() {
            if last.target_version > self.current_version {
                return Err(MigrationError::TargetAboveCurrent {
                    target: last.target_version,
                    current: self.current_version,
                });
            }
            if last.target_version < self.current_version {
                return Err(MigrationError::IncompleteChain {
                    reached: last.target_version,
                    current: self.current_version,
                });
            }
        }

        Ok(VersionedJson {
            current_version: self.current_version,
            default_version: self.default_version,
            version_key: self.version_key,
            migrations: self.migrations,
            _record: PhantomData,
        })
    }
}

/// Serializer for one record type at one schema version
pub struct VersionedJson<T> {
    current_version: u32,
    default_version: u32,
    version_key: String,
    migrations: Vec<Migration>,
    _record: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for VersionedJson<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedJson")
            .field("current_version", &self.current_version)
            .field("default_version", &self.default_version)
            .field("version_key", &self.version_key)
            .field("migrations", &self.migrations)
            .finish()
    }
}

impl<T> VersionedJson<T> {
    pub fn builder(current_version: u32) -> VersionedJsonBuilder<T> {
        VersionedJsonBuilder {
            current_version,
            default_version: 0,
            version_key: DEFAULT_VERSION_KEY.to_string(),
            migrations: Vec::new(),
            _record: PhantomData,
        }
    }

    /// Shorthand for a serializer using the default key and default version
    pub fn new(current_version: u32, migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        migrations
            .into_iter()
            .fold(Self::builder(current_version), VersionedJsonBuilder::migration)
            .build()
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub fn version_key(&self) -> &str {
        &self.version_key
    }

    /// Reads the marker, strips it and applies every pending migration.
    ///
    /// The returned object is shaped for the current version. A failing step
    /// aborts the whole call; the error carries the payload as it was read.
    pub fn migrate_value(&self, payload: Value) -> Result<Value, MigrationError> {
        let Value::Object(mut map) = payload else {
            return Err(MigrationError::NotAnObject);
        };

        let version = match map.get(&self.version_key) {
            None => self.default_version,
            Some(marker) => {
                let found = marker
                    .as_u64()
                    .ok_or_else(|| MigrationError::MalformedMarker {
                        key: self.version_key.clone(),
                        found: marker.clone(),
                    })?;
                if found > u64::from(self.current_version) {
                    return Err(MigrationError::UnsupportedVersion {
                        found,
                        current: self.current_version,
                    });
                }
                found as u32
            }
        };

        if version == self.current_version {
            map.remove(&self.version_key);
            return Ok(Value::Object(map));
        }

        let original = Value::Object(map.clone());
        map.remove(&self.version_key);

        for migration in self
            .migrations
            .iter()
            .filter(|m| m.target_version > version)
        {
            (migration.transform)(&mut map).map_err(|err| MigrationError::StepFailed {
                target: migration.target_version,
                reason: format!("{:#}", err),
                payload: original.clone(),
            })?;
            log::debug!(
                "migrated record from version {} to {}",
                version,
                migration.target_version
            );
        }

        Ok(Value::Object(map))
    }
}

impl<T: Serialize> VersionedJson<T> {
    /// Serializes the record and stamps it with the current version
    pub fn to_value(&self, record: &T) -> Result<Value> {
        let Value::Object(mut map) = serde_json::to_value(record)? else {
            return Err(MigrationError::NotAnObject.into());
        };
        map.insert(
            self.version_key.clone(),
            Value::from(self.current_version),
        );
        Ok(Value::Object(map))
    }

    pub fn to_string_pretty(&self, record: &T) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_value(record)?)?)
    }
}

impl<T: DeserializeOwned> VersionedJson<T> {
    pub fn from_value(&self, payload: Value) -> Result<T> {
        let migrated = self.migrate_value(payload)?;
        serde_json::from_value(migrated).map_err(|source| {
            MigrationError::Decode {
                version: self.current_version,
                source,
            }
            .into()
        })
    }

    pub fn from_str(&self, json: &str) -> Result<T> {
        let payload: Value = serde_json::from_str(json)?;
        self.from_value(payload)
    }
}
