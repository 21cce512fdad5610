//! Moving whole catalogs between backends
//!
//! `copy_catalog` converts an archive from one backend to another;
//! `export_to_json` / `import_from_json` go through a single versioned
//! snapshot file for backup and restore.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Story, StoryFile, Tag, TagCategory};
use crate::versioned::VersionedJson;

use super::traits::CatalogBackend;

/// Current schema version of exported snapshots
pub const SNAPSHOT_VERSION: u32 = 1;

/// Every record of a catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub categories: Vec<TagCategory>,
    pub tags: Vec<Tag>,
    pub stories: Vec<Story>,
    pub files: Vec<StoryFile>,
}

/// Counts of records written by a transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub categories: usize,
    pub tags: usize,
    pub stories: usize,
    pub files: usize,
    /// Story tag references dropped because the tag no longer exists
    pub dangling_tags: usize,
}

fn snapshot_codec() -> Result<VersionedJson<CatalogSnapshot>> {
    Ok(VersionedJson::new(SNAPSHOT_VERSION, Vec::new())?)
}

/// Reads every record from `backend`
pub fn snapshot(backend: &dyn CatalogBackend) -> Result<CatalogSnapshot> {
    Ok(CatalogSnapshot {
        categories: backend.list_categories()?,
        tags: backend.list_tags()?,
        stories: backend.list_stories()?,
        files: backend.list_files()?,
    })
}

/// Writes `snapshot` into `backend`, which is expected to be empty.
///
/// Implications and sequel links are written in a second pass so records
/// can reference each other in any order.
pub fn restore(snapshot: &CatalogSnapshot, backend: &dyn CatalogBackend) -> Result<TransferSummary> {
    let mut summary = TransferSummary::default();

    for category in &snapshot.categories {
        backend.create_category(category)?;
        summary.categories += 1;
    }

    for tag in &snapshot.tags {
        backend.create_tag(&tag.edit(|d| d.implied_tags.clear())?)?;
        summary.tags += 1;
    }
    for tag in snapshot.tags.iter().filter(|t| !t.implied_tags().is_empty()) {
        backend.update_tag(tag)?;
    }

    let known: BTreeSet<_> = snapshot.tags.iter().map(Tag::id).collect();
    for story in &snapshot.stories {
        let unlinked = story.edit(|d| {
            d.tags.retain(|id| known.contains(id));
            d.sequels.clear();
            d.prequels.clear();
        })?;
        summary.dangling_tags += story.tags().len() - unlinked.tags().len();
        backend.create_story(&unlinked)?;
        summary.stories += 1;
    }
    for story in &snapshot.stories {
        if story.sequels().is_empty() && story.prequels().is_empty() {
            continue;
        }
        backend.update_story(&story.edit(|d| d.tags.retain(|id| known.contains(id)))?)?;
    }

    for file in &snapshot.files {
        backend.add_file(file)?;
        summary.files += 1;
    }

    if summary.dangling_tags > 0 {
        log::warn!(
            "dropped {} reference(s) to deleted tags while restoring",
            summary.dangling_tags
        );
    }
    Ok(summary)
}

/// Copies every record of `from` into the empty catalog `to`
pub fn copy_catalog(from: &dyn CatalogBackend, to: &dyn CatalogBackend) -> Result<TransferSummary> {
    let summary = restore(&snapshot(from)?, to)?;
    log::info!(
        "copied {} categories, {} tags, {} stories and {} files from {} to {}",
        summary.categories,
        summary.tags,
        summary.stories,
        summary.files,
        from.backend_type(),
        to.backend_type()
    );
    Ok(summary)
}

/// Exports `backend` to a versioned JSON snapshot file
pub fn export_to_json<P: AsRef<Path>>(backend: &dyn CatalogBackend, json_path: P) -> Result<TransferSummary> {
    let snapshot = snapshot(backend)?;
    fs::write(json_path, snapshot_codec()?.to_string_pretty(&snapshot)?)?;
    Ok(TransferSummary {
        categories: snapshot.categories.len(),
        tags: snapshot.tags.len(),
        stories: snapshot.stories.len(),
        files: snapshot.files.len(),
        dangling_tags: 0,
    })
}

/// Reads a snapshot file written by [`export_to_json`] into `backend`
pub fn import_from_json<P: AsRef<Path>>(json_path: P, backend: &dyn CatalogBackend) -> Result<TransferSummary> {
    let json = fs::read_to_string(json_path)?;
    let snapshot = snapshot_codec()?.from_str(&json)?;
    restore(&snapshot, backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JsonBackend, SqliteBackend, StoryRepository, TagRepository};
    use crate::models::{
        CategoryDraft, FileFormat, StoryDraft, StoryFileDraft, StoryFileId, TagDraft,
    };
    use tempfile::TempDir;

    /// Genre with a mutual implication, two mutual sequels, one file and a
    /// story tag whose tag was deleted
    fn seed(backend: &dyn CatalogBackend) {
        let genre = TagCategory::new(CategoryDraft::new("Genre")).unwrap();
        backend.create_category(&genre).unwrap();
        let a = Tag::new(TagDraft::new("A", genre.id())).unwrap();
        backend.create_tag(&a).unwrap();
        let b = Tag::new({
            let mut draft = TagDraft::new("B", genre.id());
            draft.implied_tags.insert(a.id());
            draft
        })
        .unwrap();
        backend.create_tag(&b).unwrap();
        backend
            .update_tag(
                &a.edit(|d| {
                    d.implied_tags.insert(b.id());
                })
                .unwrap(),
            )
            .unwrap();
        let gone = Tag::new(TagDraft::new("Gone", genre.id())).unwrap();
        backend.create_tag(&gone).unwrap();

        let first = Story::new({
            let mut draft = StoryDraft::new("First");
            draft.tags.insert(a.id());
            draft.tags.insert(gone.id());
            draft
        })
        .unwrap();
        backend.create_story(&first).unwrap();
        let second = Story::new({
            let mut draft = StoryDraft::new("Second");
            draft.sequels.insert(first.id());
            draft.prequels.insert(first.id());
            draft
        })
        .unwrap();
        backend.create_story(&second).unwrap();
        backend.delete_tag(gone.id()).unwrap();

        let file = StoryFile::new(StoryFileDraft {
            id: StoryFileId::new(),
            story_id: first.id(),
            format: FileFormat::Txt,
            file_name: "first.txt".to_string(),
            sha256: "0f".repeat(32),
            word_count: 3,
            size: 15,
        })
        .unwrap();
        backend.add_file(&file).unwrap();
    }

    #[test]
    fn test_copy_json_to_sqlite() {
        let source_dir = TempDir::new().unwrap();
        let dest_dir = TempDir::new().unwrap();
        let source = JsonBackend::open(source_dir.path()).unwrap();
        let dest = SqliteBackend::new(dest_dir.path().join("catalog.db")).unwrap();
        seed(&source);

        let summary = copy_catalog(&source, &dest).unwrap();
        assert_eq!(summary.categories, 1);
        assert_eq!(summary.tags, 2);
        assert_eq!(summary.stories, 2);
        assert_eq!(summary.files, 1);
        assert_eq!(summary.dangling_tags, 1);

        assert_eq!(dest.tag_graph().unwrap(), source.tag_graph().unwrap());

        let expected: Vec<Story> = source
            .list_stories()
            .unwrap()
            .into_iter()
            .map(|s| {
                let known = source.existing_tags(s.tags()).unwrap();
                s.edit(|d| d.tags = known).unwrap()
            })
            .collect();
        assert_eq!(dest.list_stories().unwrap(), expected);
    }

    #[test]
    fn test_export_and_import_snapshot() {
        let source_dir = TempDir::new().unwrap();
        let dest_dir = TempDir::new().unwrap();
        let source = SqliteBackend::new(source_dir.path().join("catalog.db")).unwrap();
        let dest = JsonBackend::open(dest_dir.path()).unwrap();
        seed(&source);

        let export_path = source_dir.path().join("export.json");
        let exported = export_to_json(&source, &export_path).unwrap();
        assert_eq!(exported.stories, 2);

        let raw = fs::read_to_string(&export_path).unwrap();
        assert!(raw.contains("\"#version\": 1"));

        let imported = import_from_json(&export_path, &dest).unwrap();
        assert_eq!(imported.files, 1);
        assert_eq!(dest.tag_graph().unwrap(), source.tag_graph().unwrap());
        assert_eq!(dest.list_stories().unwrap().len(), 2);
        assert_eq!(
            dest.get_file_by_name("first.txt").unwrap(),
            source.get_file_by_name("first.txt").unwrap()
        );
    }
}
