//! Catalog store traits
//!
//! `TagRepository` owns the lifecycle of tags and tag categories,
//! `StoryRepository` owns stories and their files. Every backend implements
//! both and is used through `CatalogBackend`.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::{story_series, TagGraph};
use crate::models::{
    CategoryId, Story, StoryFile, StoryFileId, StoryId, Tag, TagCategory, TagId,
};

/// Types of catalog backends available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// One JSON file per record in the archive directory
    Json,
    /// SQLite database inside the archive directory
    Sqlite,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Json => write!(f, "JSON"),
            BackendType::Sqlite => write!(f, "SQLite"),
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(BackendType::Json),
            "sqlite" | "db" => Ok(BackendType::Sqlite),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Tag graph store
///
/// Create and update reject name collisions with another entity and
/// references to missing categories or tags. Update and delete of an
/// unknown id are no-ops.
pub trait TagRepository: Send + Sync {
    // =========================================================================
    // Categories
    // =========================================================================

    fn get_category(&self, id: CategoryId) -> Result<Option<TagCategory>>;

    fn get_category_by_name(&self, name: &str) -> Result<Option<TagCategory>>;

    /// Lists categories ordered by sort order, then name
    fn list_categories(&self) -> Result<Vec<TagCategory>>;

    fn create_category(&self, category: &TagCategory) -> Result<()>;

    fn update_category(&self, category: &TagCategory) -> Result<()>;

    /// Deletes a category that no tag references; tags are never cascaded
    fn delete_category(&self, id: CategoryId) -> Result<()>;

    /// Reassigns every tag of `from` to `to` and returns how many moved
    fn change_category(&self, from: CategoryId, to: CategoryId) -> Result<usize>;

    // =========================================================================
    // Tags
    // =========================================================================

    fn get_tag(&self, id: TagId) -> Result<Option<Tag>>;

    /// Case-sensitive exact match
    fn get_tag_by_name(&self, name: &str) -> Result<Option<Tag>>;

    /// Lists tags ordered by name
    fn list_tags(&self) -> Result<Vec<Tag>>;

    fn tags_in_category(&self, category: CategoryId) -> Result<Vec<Tag>>;

    /// Tags in the category plus every tag whose implications lead into it
    fn tags_in_category_including_implied(&self, category: CategoryId) -> Result<Vec<Tag>>;

    /// Tags that directly declare `tag` as implied
    fn implying_tags(&self, tag: TagId) -> Result<Vec<Tag>>;

    fn create_tag(&self, tag: &Tag) -> Result<()>;

    fn update_tag(&self, tag: &Tag) -> Result<()>;

    /// Deletes a tag and the implication edges pointing at it. Stories keep
    /// their (now dangling) reference.
    fn delete_tag(&self, id: TagId) -> Result<()>;

    // =========================================================================
    // Derived queries
    // =========================================================================

    /// Snapshot of the whole graph for in-memory traversal
    fn tag_graph(&self) -> Result<TagGraph> {
        Ok(TagGraph::from_parts(self.list_categories()?, self.list_tags()?))
    }

    /// The subset of `ids` that still names an existing tag
    fn existing_tags(&self, ids: &BTreeSet<TagId>) -> Result<BTreeSet<TagId>> {
        let mut existing = BTreeSet::new();
        for id in ids {
            if self.get_tag(*id)?.is_some() {
                existing.insert(*id);
            }
        }
        Ok(existing)
    }

    /// Explicit tags plus everything they imply; dangling ids are dropped
    fn resolve_implied(&self, explicit: &BTreeSet<TagId>) -> Result<BTreeSet<TagId>> {
        Ok(self.tag_graph()?.implied_closure(explicit.iter().copied()))
    }
}

/// Story repository
///
/// Sequel and prequel links are stored once per pair: listing B as a sequel
/// of A is the same fact as listing A as a prequel of B, so both stories
/// observe it on the next read.
pub trait StoryRepository: Send + Sync {
    /// All stories with tags, sequels, prequels and files attached
    fn list_stories(&self) -> Result<Vec<Story>>;

    fn get_story(&self, id: StoryId) -> Result<Option<Story>>;

    /// Inserts a story; tags and linked stories must exist
    fn create_story(&self, story: &Story) -> Result<()>;

    /// Replaces a story and its links; unknown ids are a no-op
    fn update_story(&self, story: &Story) -> Result<()>;

    /// Deletes a story with its links and file records
    fn delete_story(&self, id: StoryId) -> Result<()>;

    // =========================================================================
    // Story files
    // =========================================================================

    /// Records a file; its name must be unique across the archive
    fn add_file(&self, file: &StoryFile) -> Result<()>;

    fn get_file(&self, id: StoryFileId) -> Result<Option<StoryFile>>;

    fn get_file_by_name(&self, file_name: &str) -> Result<Option<StoryFile>>;

    fn files_for_story(&self, story: StoryId) -> Result<Vec<StoryFile>>;

    /// Every file record in the archive, ordered by file name
    fn list_files(&self) -> Result<Vec<StoryFile>>;

    fn delete_file(&self, id: StoryFileId) -> Result<()>;

    /// Every story connected to `id` through sequel/prequel links, itself
    /// included, ordered by creation time
    fn series(&self, id: StoryId) -> Result<Vec<Story>> {
        let stories = self.list_stories()?;
        let members = story_series(&stories, id);
        let mut series: Vec<Story> = stories
            .into_iter()
            .filter(|s| members.contains(&s.id()))
            .collect();
        series.sort_by_key(|s| s.created());
        Ok(series)
    }
}

/// A complete catalog backend
pub trait CatalogBackend: TagRepository + StoryRepository {
    /// Returns the backend type
    fn backend_type(&self) -> BackendType;

    /// Returns the archive file or directory the backend reads
    fn location(&self) -> &Path;

    /// Returns statistics about the catalog
    fn stats(&self) -> Result<CatalogStats> {
        Ok(CatalogStats {
            category_count: self.list_categories()?.len(),
            tag_count: self.list_tags()?.len(),
            story_count: self.list_stories()?.len(),
            backend_type: self.backend_type(),
        })
    }
}

/// Statistics about a catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogStats {
    pub category_count: usize,
    pub tag_count: usize,
    pub story_count: usize,
    pub backend_type: BackendType,
}
