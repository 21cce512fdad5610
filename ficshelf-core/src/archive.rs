//! Archive directory layout
//!
//! ```text
//! <root>/
//!   tags.json                 tag tree (file backend)
//!   catalog.db                SQLite database (database backend)
//!   tag_mappings.json         tag-name mapping cache
//!   stories/<id>/story.json   story record (file backend)
//!   stories/<id>/<file name>  story file contents
//!   stories/<id>/cover.<ext>  cover image
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::{CoverFormat, StoryId};

pub const TAG_TREE_FILE: &str = "tags.json";
pub const DATABASE_FILE: &str = "catalog.db";
pub const TAG_MAPPINGS_FILE: &str = "tag_mappings.json";
pub const STORIES_DIR: &str = "stories";
pub const STORY_RECORD_FILE: &str = "story.json";

/// Resolves paths inside one user's archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    root: PathBuf,
}

impl ArchiveLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tag_tree_path(&self) -> PathBuf {
        self.root.join(TAG_TREE_FILE)
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join(DATABASE_FILE)
    }

    pub fn tag_mappings_path(&self) -> PathBuf {
        self.root.join(TAG_MAPPINGS_FILE)
    }

    pub fn stories_dir(&self) -> PathBuf {
        self.root.join(STORIES_DIR)
    }

    pub fn story_dir(&self, id: StoryId) -> PathBuf {
        self.stories_dir().join(id.to_string())
    }

    pub fn story_record_path(&self, id: StoryId) -> PathBuf {
        self.story_dir(id).join(STORY_RECORD_FILE)
    }

    pub fn story_file_path(&self, id: StoryId, file_name: &str) -> PathBuf {
        self.story_dir(id).join(file_name)
    }

    pub fn cover_path(&self, id: StoryId, format: CoverFormat) -> PathBuf {
        self.story_dir(id)
            .join(format!("cover.{}", format.extension()))
    }

    /// Creates the root and the stories directory if they are missing
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.stories_dir())?;
        Ok(())
    }

    /// Ids of every story directory currently on disk
    pub fn story_ids(&self) -> Result<Vec<StoryId>> {
        let dir = self.stories_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_str().map(str::parse::<StoryId>) {
                Some(Ok(id)) => ids.push(id),
                _ => log::debug!("skipping unexpected entry {:?}", entry.path()),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
