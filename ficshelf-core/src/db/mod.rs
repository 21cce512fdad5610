//! Storage backends for the catalog
//!
//! Both backends implement [`TagRepository`] and [`StoryRepository`] and are
//! normally used as a boxed [`CatalogBackend`] obtained from
//! [`create_backend`].

mod json_backend;
mod sqlite_backend;
mod traits;
mod transfer;

#[cfg(test)]
pub(crate) mod conformance;

pub use json_backend::{JsonBackend, STORY_RECORD_VERSION, TAG_TREE_VERSION};
pub use sqlite_backend::SqliteBackend;
pub use traits::{BackendType, CatalogBackend, CatalogStats, StoryRepository, TagRepository};
pub use transfer::{
    copy_catalog, export_to_json, import_from_json, restore, snapshot, CatalogSnapshot,
    TransferSummary, SNAPSHOT_VERSION,
};

use std::path::Path;

use crate::archive::ArchiveLayout;
use crate::error::Result;

/// Picks the backend for the archive at `root`: an explicit choice wins,
/// otherwise an existing database selects SQLite and JSON files are the default
pub fn infer_backend_type(root: &Path, backend_type: Option<BackendType>) -> BackendType {
    backend_type.unwrap_or_else(|| {
        if ArchiveLayout::new(root).database_path().exists() {
            BackendType::Sqlite
        } else {
            BackendType::Json
        }
    })
}

/// Opens (or creates) the catalog of the archive at `root`
pub fn create_backend(root: &Path, backend_type: Option<BackendType>) -> Result<Box<dyn CatalogBackend>> {
    let layout = ArchiveLayout::new(root);
    match infer_backend_type(root, backend_type) {
        BackendType::Json => Ok(Box::new(JsonBackend::open(root)?)),
        BackendType::Sqlite => {
            layout.ensure_dirs()?;
            Ok(Box::new(SqliteBackend::new(layout.database_path())?))
        }
    }
}
