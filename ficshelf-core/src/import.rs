//! Importing scraped stories into the archive
//!
//! A [`MetadataProvider`] turns a URL into an [`ImportedStory`]; the
//! [`Importer`] normalizes it, maps its free-text tags through the
//! [`TagMappingCache`] and persists the story, its files and its cover.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::archive::{ArchiveLayout, STORY_RECORD_FILE};
use crate::db::CatalogBackend;
use crate::error::{CatalogError, Result};
use crate::mapping::TagMappingCache;
use crate::models::{
    CoverFormat, FileFormat, Story, StoryDraft, StoryFile, StoryFileDraft, StoryFileId, TagId,
    LONG_TEXT_MAX, STORY_TEXT_MAX,
};

/// Name given to stories whose title could not be scraped
pub const PLACEHOLDER_NAME: &str = "Untitled";

/// Story metadata and contents as produced by a provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportedStory {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub changed: Option<DateTime<Utc>>,
    /// Free-text tags as shown by the source
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub cover: Option<ImportedCover>,
    #[serde(default)]
    pub files: Vec<ImportedFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedCover {
    pub format: CoverFormat,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedFile {
    pub file_name: String,
    /// Guessed from the file name when absent
    #[serde(default)]
    pub format: Option<FileFormat>,
    #[serde(with = "hex_bytes")]
    pub content: Vec<u8>,
}

/// Binary payloads travel as hex strings in imported-story JSON
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Providers
// ============================================================================

/// A source of story metadata, e.g. one fiction site
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this provider knows how to fetch `url`
    fn supports(&self, url: &str) -> bool;

    fn fetch(&self, url: &str) -> anyhow::Result<ImportedStory>;
}

/// Providers selected by URL, first match wins
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Box<dyn MetadataProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Box<dyn MetadataProvider>) {
        log::debug!("registered import provider '{}'", provider.name());
        self.providers.push(provider);
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn provider_for(&self, url: &str) -> Option<&dyn MetadataProvider> {
        self.providers
            .iter()
            .find(|p| p.supports(url))
            .map(|p| p.as_ref())
    }

    pub fn fetch(&self, url: &str) -> Result<ImportedStory> {
        let provider = self
            .provider_for(url)
            .ok_or_else(|| CatalogError::UnsupportedSource(url.to_string()))?;
        provider.fetch(url).map_err(|e| CatalogError::Provider {
            provider: provider.name().to_string(),
            reason: format!("{:#}", e),
        })
    }
}

// ============================================================================
// Importer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    /// Pause between sequential fetches
    pub delay: Duration,
    /// Remember resolved tag names in the mapping cache
    pub update_mappings: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1_000),
            update_mappings: true,
        }
    }
}

/// What a single import produced
#[derive(Debug, Clone, PartialEq)]
pub struct ImportOutcome {
    pub story: Story,
    pub files: Vec<StoryFile>,
    /// Scraped tags that matched no existing tag
    pub unmapped_tags: Vec<String>,
    /// Written cover, if there was one and writing it succeeded
    pub cover: Option<PathBuf>,
}

pub struct Importer<'a> {
    backend: &'a dyn CatalogBackend,
    layout: ArchiveLayout,
    mappings: &'a TagMappingCache,
    options: ImportOptions,
}

impl<'a> Importer<'a> {
    pub fn new(backend: &'a dyn CatalogBackend, layout: ArchiveLayout, mappings: &'a TagMappingCache) -> Self {
        Self {
            backend,
            layout,
            mappings,
            options: ImportOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ImportOptions) -> Self {
        self.options = options;
        self
    }

    /// Persists `imported` as a new story.
    ///
    /// Every record is validated before anything is written. If writing the
    /// story or one of its files fails, the story is removed again and the
    /// mapping cache is left untouched.
    pub fn import(&self, imported: ImportedStory) -> Result<ImportOutcome> {
        let mapped = self.mappings.map_tags(self.backend, &imported.tags)?;
        let unmapped_tags: Vec<String> = imported
            .tags
            .iter()
            .filter(|t| !t.trim().is_empty() && !mapped.contains_key(*t))
            .cloned()
            .collect();

        let mut draft = story_draft(&imported);
        draft.tags = mapped.values().copied().collect::<BTreeSet<TagId>>();
        let story = Story::new(draft)?;

        let mut taken = BTreeSet::new();
        let mut files = Vec::with_capacity(imported.files.len());
        for file in &imported.files {
            let record = self.file_record(&story, file, &taken)?;
            taken.insert(record.file_name().to_string());
            files.push((record, file.content.as_slice()));
        }

        self.backend.create_story(&story)?;
        if let Err(e) = self.write_files(&story, &files) {
            self.discard(&story);
            return Err(e);
        }
        log::info!(
            "imported '{}' ({} tag(s), {} unmapped)",
            story.name(),
            story.tags().len(),
            unmapped_tags.len()
        );

        if self.options.update_mappings && !mapped.is_empty() {
            self.mappings.update_mappings(self.backend, &mapped)?;
        }

        let cover = imported
            .cover
            .as_ref()
            .and_then(|cover| self.write_cover(&story, cover));

        let story = self.backend.get_story(story.id())?.unwrap_or(story);
        Ok(ImportOutcome {
            story,
            files: files.into_iter().map(|(record, _)| record).collect(),
            unmapped_tags,
            cover,
        })
    }

    /// Fetches `url` through the matching provider and imports the result
    pub fn import_url(&self, registry: &ProviderRegistry, url: &str) -> Result<ImportOutcome> {
        let imported = registry.fetch(url)?;
        self.import(imported)
    }

    /// Imports each URL in turn, pausing between fetches. A failing URL does
    /// not stop the ones after it.
    pub fn import_urls<S: AsRef<str>>(
        &self,
        registry: &ProviderRegistry,
        urls: &[S],
    ) -> Vec<(String, Result<ImportOutcome>)> {
        let mut results = Vec::with_capacity(urls.len());
        for (i, url) in urls.iter().enumerate() {
            if i > 0 && !self.options.delay.is_zero() {
                thread::sleep(self.options.delay);
            }
            let url = url.as_ref();
            let result = self.import_url(registry, url);
            if let Err(e) = &result {
                log::warn!("import of {} failed: {}", url, e);
            }
            results.push((url.to_string(), result));
        }
        results
    }

    /// The validated record for `file`, named clear of `taken` and of every
    /// file already in the archive
    fn file_record(
        &self,
        story: &Story,
        file: &ImportedFile,
        taken: &BTreeSet<String>,
    ) -> Result<StoryFile> {
        let file_name = self.free_file_name(&file.file_name, taken)?;
        let format = file
            .format
            .unwrap_or_else(|| FileFormat::for_file_name(&file_name));

        Ok(StoryFile::new(StoryFileDraft {
            id: StoryFileId::new(),
            story_id: story.id(),
            format,
            sha256: hex::encode(Sha256::digest(&file.content)),
            word_count: if format.is_text() {
                count_words(&file.content)
            } else {
                0
            },
            size: file.content.len() as u64,
            file_name,
        })?)
    }

    fn write_files(&self, story: &Story, files: &[(StoryFile, &[u8])]) -> Result<()> {
        fs::create_dir_all(self.layout.story_dir(story.id()))?;
        for (record, content) in files {
            fs::write(
                self.layout.story_file_path(story.id(), record.file_name()),
                content,
            )?;
            self.backend.add_file(record)?;
        }
        Ok(())
    }

    /// Rolls back a partially written story
    fn discard(&self, story: &Story) {
        if let Err(e) = self.backend.delete_story(story.id()) {
            log::warn!("could not remove story '{}' after failed import: {}", story.name(), e);
        }
        let story_dir = self.layout.story_dir(story.id());
        match fs::remove_dir_all(&story_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("could not remove {:?} after failed import: {}", story_dir, e),
        }
    }

    /// A file name not used anywhere in the archive, derived from `requested`
    fn free_file_name(&self, requested: &str, taken: &BTreeSet<String>) -> Result<String> {
        let base = Path::new(requested.trim())
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("story.txt")
            .to_string();

        let (stem, ext) = match base.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{}", ext)),
            _ => (base.clone(), String::new()),
        };

        let mut candidate = base;
        let mut n = 2;
        while is_reserved(&candidate)
            || taken.contains(&candidate)
            || self.backend.get_file_by_name(&candidate)?.is_some()
        {
            candidate = format!("{} ({}){}", stem, n, ext);
            n += 1;
        }
        Ok(candidate)
    }

    fn write_cover(&self, story: &Story, cover: &ImportedCover) -> Option<PathBuf> {
        let path = self.layout.cover_path(story.id(), cover.format);
        match fs::write(&path, &cover.data) {
            Ok(()) => Some(path),
            Err(e) => {
                log::warn!("could not write cover for '{}': {}", story.name(), e);
                None
            }
        }
    }
}

fn is_reserved(file_name: &str) -> bool {
    file_name.starts_with(STORY_RECORD_FILE) || file_name.starts_with("cover.")
}

fn count_words(content: &[u8]) -> u64 {
    String::from_utf8_lossy(content).split_whitespace().count() as u64
}

fn clean(value: Option<&String>, max: usize) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    if value.chars().count() > max {
        log::debug!("truncating scraped text to {} characters", max);
        return Some(value.chars().take(max).collect());
    }
    Some(value.to_string())
}

/// Story fields from scraped values, with placeholders and truncation
fn story_draft(imported: &ImportedStory) -> StoryDraft {
    let name = clean(imported.name.as_ref(), STORY_TEXT_MAX).unwrap_or_else(|| {
        log::warn!(
            "no title scraped from {}; using '{}'",
            imported.url.as_deref().unwrap_or("imported story"),
            PLACEHOLDER_NAME
        );
        PLACEHOLDER_NAME.to_string()
    });

    let mut draft = StoryDraft::new(name);
    draft.author = clean(imported.author.as_ref(), STORY_TEXT_MAX);
    draft.url = clean(imported.url.as_ref(), STORY_TEXT_MAX);
    draft.description = clean(imported.description.as_ref(), LONG_TEXT_MAX);

    let created = imported.published.or(imported.changed).unwrap_or(draft.created);
    draft.created = created;
    draft.updated = imported.changed.map_or(created, |changed| changed.max(created));
    draft
}

/// Parses an imported-story JSON document
pub fn read_imported_story(json: &str) -> Result<ImportedStory> {
    Ok(serde_json::from_str(json)?)
}

/// Tags that the mapping would give each scraped name, for previews
pub fn preview_tags(
    backend: &dyn CatalogBackend,
    mappings: &TagMappingCache,
    imported: &ImportedStory,
) -> Result<BTreeMap<String, TagId>> {
    mappings.map_tags(backend, &imported.tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JsonBackend, SqliteBackend, StoryRepository, TagRepository};
    use crate::models::{CategoryDraft, Tag, TagCategory, TagDraft};
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        layout: ArchiveLayout,
        backend: JsonBackend,
        mappings: TagMappingCache,
        romance: Tag,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(dir.path().join("archive"));
        let backend = JsonBackend::open(layout.root()).unwrap();
        let genre = TagCategory::new(CategoryDraft::new("Genre")).unwrap();
        backend.create_category(&genre).unwrap();
        let romance = Tag::new(TagDraft::new("Romance", genre.id())).unwrap();
        backend.create_tag(&romance).unwrap();
        let mappings = TagMappingCache::open(layout.tag_mappings_path()).unwrap();
        Fixture {
            _dir: dir,
            layout,
            backend,
            mappings,
            romance,
        }
    }

    fn text_file(name: &str, text: &str) -> ImportedFile {
        ImportedFile {
            file_name: name.to_string(),
            format: None,
            content: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_import_maps_tags_and_writes_files() {
        let fx = fixture();
        let importer = Importer::new(&fx.backend, fx.layout.clone(), &fx.mappings);

        let outcome = importer
            .import(ImportedStory {
                name: Some("  The Long Way  ".to_string()),
                author: Some("someone".to_string()),
                tags: BTreeSet::from(["romance".to_string(), "Slow Burn".to_string()]),
                files: vec![text_file("chapter.txt", "one two  three\nfour")],
                cover: Some(ImportedCover {
                    format: CoverFormat::Png,
                    data: vec![0x89, b'P', b'N', b'G'],
                }),
                ..Default::default()
            })
            .unwrap();

        let story = &outcome.story;
        assert_eq!(story.name(), "The Long Way");
        assert_eq!(story.tags(), &BTreeSet::from([fx.romance.id()]));
        assert_eq!(outcome.unmapped_tags, vec!["Slow Burn".to_string()]);
        assert_eq!(story.files().len(), 1);

        let file = &outcome.files[0];
        assert_eq!(file.format(), FileFormat::Txt);
        assert_eq!(file.word_count(), 4);
        assert_eq!(file.size(), 19);
        assert_eq!(file.sha256(), hex::encode(Sha256::digest(b"one two  three\nfour")));
        assert_eq!(
            fs::read_to_string(fx.layout.story_file_path(story.id(), "chapter.txt")).unwrap(),
            "one two  three\nfour"
        );
        assert_eq!(
            outcome.cover,
            Some(fx.layout.cover_path(story.id(), CoverFormat::Png))
        );

        fx.mappings.flush();
        assert_eq!(fx.mappings.cached("romance"), Some(fx.romance.id()));
    }

    #[test]
    fn test_placeholders_and_truncation() {
        let fx = fixture();
        let importer = Importer::new(&fx.backend, fx.layout.clone(), &fx.mappings);
        let published = Utc.with_ymd_and_hms(2020, 5, 1, 0, 0, 0).unwrap();
        let changed = Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap();

        let outcome = importer
            .import(ImportedStory {
                name: Some("   ".to_string()),
                description: Some("x".repeat(LONG_TEXT_MAX + 10)),
                author: Some(String::new()),
                published: Some(published),
                changed: Some(changed),
                ..Default::default()
            })
            .unwrap();

        let story = outcome.story;
        assert_eq!(story.name(), PLACEHOLDER_NAME);
        assert_eq!(story.author(), None);
        assert_eq!(story.description().map(|d| d.chars().count()), Some(LONG_TEXT_MAX));
        assert_eq!(story.created(), published);
        assert_eq!(story.updated(), published);
    }

    #[test]
    fn test_colliding_file_names_are_renamed() {
        let fx = fixture();
        let importer = Importer::new(&fx.backend, fx.layout.clone(), &fx.mappings);
        let imported = ImportedStory {
            name: Some("Twice".to_string()),
            files: vec![text_file("story.txt", "a"), text_file("../story.txt", "b")],
            ..Default::default()
        };

        let first = importer.import(imported.clone()).unwrap();
        let second = importer.import(imported).unwrap();

        let names: Vec<&str> = first
            .files
            .iter()
            .chain(&second.files)
            .map(|f| f.file_name())
            .collect();
        assert_eq!(
            names,
            vec!["story.txt", "story (2).txt", "story (3).txt", "story (4).txt"]
        );

        let reserved = importer
            .import(ImportedStory {
                name: Some("Reserved".to_string()),
                files: vec![text_file("story.json", "{}"), text_file("cover.png", "")],
                ..Default::default()
            })
            .unwrap();
        let names: Vec<&str> = reserved.files.iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["story (2).json", "cover (2).png"]);
    }

    #[test]
    fn test_invalid_file_aborts_before_writing() {
        let fx = fixture();
        let importer = Importer::new(&fx.backend, fx.layout.clone(), &fx.mappings);
        let long_name = format!("{}.txt", "a".repeat(300));

        let result = importer.import(ImportedStory {
            name: Some("Half Done".to_string()),
            tags: BTreeSet::from(["romance".to_string()]),
            files: vec![text_file("ok.txt", "fine"), text_file(&long_name, "too long")],
            ..Default::default()
        });

        assert!(matches!(result, Err(CatalogError::Validation(_))));
        assert!(fx.backend.list_stories().unwrap().is_empty());
        assert!(fx.backend.get_file_by_name("ok.txt").unwrap().is_none());
        assert_eq!(fs::read_dir(fx.layout.stories_dir()).unwrap().count(), 0);
        fx.mappings.flush();
        assert!(fx.mappings.cached("romance").is_none());
    }

    #[test]
    fn test_failed_write_removes_story() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(dir.path());
        let backend = SqliteBackend::new(layout.database_path()).unwrap();
        let mappings = TagMappingCache::open(layout.tag_mappings_path()).unwrap();
        // story directories cannot be created under a plain file
        fs::write(layout.stories_dir(), "").unwrap();

        let importer = Importer::new(&backend, layout, &mappings);
        let result = importer.import(ImportedStory {
            name: Some("Nowhere".to_string()),
            files: vec![text_file("chapter.txt", "words")],
            ..Default::default()
        });

        assert!(matches!(result, Err(CatalogError::Io(_))));
        assert!(backend.list_stories().unwrap().is_empty());
        assert!(backend.get_file_by_name("chapter.txt").unwrap().is_none());
    }

    struct FakeSite;

    impl MetadataProvider for FakeSite {
        fn name(&self) -> &str {
            "fake"
        }

        fn supports(&self, url: &str) -> bool {
            url.starts_with("https://fake.example/")
        }

        fn fetch(&self, url: &str) -> anyhow::Result<ImportedStory> {
            if url.ends_with("/missing") {
                anyhow::bail!("404 not found");
            }
            Ok(ImportedStory {
                name: Some("Fetched".to_string()),
                url: Some(url.to_string()),
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_registry_dispatch() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(dir.path());
        let backend = SqliteBackend::new(dir.path().join("catalog.db")).unwrap();
        let mappings = TagMappingCache::open(layout.tag_mappings_path()).unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(FakeSite));
        assert_eq!(registry.names(), vec!["fake"]);

        let importer = Importer::new(&backend, layout, &mappings).with_options(ImportOptions {
            delay: Duration::ZERO,
            update_mappings: false,
        });
        let results = importer.import_urls(
            &registry,
            &[
                "https://fake.example/1",
                "https://fake.example/missing",
                "https://elsewhere.example/2",
            ],
        );

        assert_eq!(results[0].1.as_ref().unwrap().story.name(), "Fetched");
        assert!(matches!(
            results[1].1,
            Err(CatalogError::Provider { ref provider, .. }) if provider == "fake"
        ));
        assert!(matches!(results[2].1, Err(CatalogError::UnsupportedSource(_))));
        assert_eq!(backend.list_stories().unwrap().len(), 1);
    }

    #[test]
    fn test_imported_story_json() {
        let story = read_imported_story(
            r#"{
                "name": "From JSON",
                "tags": ["Romance", "Unknown"],
                "files": [{"file_name": "a.html", "content": "3c703e6869"}]
            }"#,
        )
        .unwrap();
        assert_eq!(story.files[0].content, b"<p>hi");

        let fx = fixture();
        let preview = preview_tags(&fx.backend, &fx.mappings, &story).unwrap();
        assert_eq!(preview.keys().collect::<Vec<_>>(), vec!["Romance"]);
    }
}
