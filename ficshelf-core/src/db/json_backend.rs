//! JSON files catalog backend
//!
//! The catalog lives in the archive directory as plain versioned JSON: one
//! tag tree file plus one record per story. Everything is read into memory
//! when the archive is opened; a mutation is applied to a copy of the
//! affected state, written through [`JsonFile`], and only then made visible.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::archive::ArchiveLayout;
use crate::error::{CatalogError, Result};
use crate::graph::TagGraph;
use crate::models::{
    CategoryId, Color, Story, StoryFile, StoryFileId, StoryId, Tag, TagCategory, TagId,
};
use crate::storage::JsonFile;
use crate::versioned::{Migration, VersionedJson};

use super::traits::{BackendType, CatalogBackend, StoryRepository, TagRepository};

/// Current schema version of `tags.json`
pub const TAG_TREE_VERSION: u32 = 2;

/// Current schema version of `story.json`
pub const STORY_RECORD_VERSION: u32 = 1;

/// Contents of the tag tree file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TagTree {
    #[serde(default)]
    categories: Vec<TagCategory>,
    #[serde(default)]
    tags: Vec<Tag>,
}

impl TagTree {
    fn from_graph(graph: &TagGraph) -> Self {
        Self {
            categories: graph.categories().into_iter().cloned().collect(),
            tags: graph.tags().into_iter().cloned().collect(),
        }
    }
}

/// Contents of one story record file. Only sequel links are written;
/// prequels and the file id set are derived when the story is read.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoryRecord {
    story: Story,
    #[serde(default)]
    files: Vec<StoryFile>,
}

fn categories_mut(tree: &mut Map<String, Value>) -> anyhow::Result<&mut Vec<Value>> {
    tree.entry("categories")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .context("'categories' is not an array")
}

/// Tag tree schema history:
/// - 0: categories without `sort_order`
/// - 1: `sort_order` added, colours still `"#rrggbb"` strings
/// - 2: colours stored as packed RGB integers
fn tag_tree_codec() -> Result<VersionedJson<TagTree>> {
    let codec = VersionedJson::builder(TAG_TREE_VERSION)
        .migration(Migration::new(1, |tree| {
            for (index, category) in categories_mut(tree)?.iter_mut().enumerate() {
                let category = category
                    .as_object_mut()
                    .context("category is not an object")?;
                category
                    .entry("sort_order")
                    .or_insert_with(|| Value::from(index));
            }
            Ok(())
        }))
        .migration(Migration::new(2, |tree| {
            for category in categories_mut(tree)? {
                let category = category
                    .as_object_mut()
                    .context("category is not an object")?;
                let packed = match category.get("color") {
                    Some(Value::String(hex)) => Some(Color::parse_hex(hex)?.packed()),
                    _ => None,
                };
                if let Some(packed) = packed {
                    category.insert("color".to_string(), Value::from(packed));
                }
            }
            Ok(())
        }))
        .build()?;
    Ok(codec)
}

#[derive(Default)]
struct CatalogState {
    graph: TagGraph,
    stories: BTreeMap<StoryId, StoryRecord>,
}

impl CatalogState {
    fn prequel_index(&self) -> BTreeMap<StoryId, BTreeSet<StoryId>> {
        let mut index: BTreeMap<StoryId, BTreeSet<StoryId>> = BTreeMap::new();
        for (id, record) in &self.stories {
            for sequel in record.story.sequels() {
                index.entry(*sequel).or_default().insert(*id);
            }
        }
        index
    }

    fn hydrate(
        &self,
        record: &StoryRecord,
        prequels: &BTreeMap<StoryId, BTreeSet<StoryId>>,
    ) -> Result<Story> {
        let id = record.story.id();
        Ok(record.story.edit(|d| {
            d.prequels = prequels.get(&id).cloned().unwrap_or_default();
            d.files = record.files.iter().map(StoryFile::id).collect();
        })?)
    }

    fn find_file(&self, matches: impl Fn(&StoryFile) -> bool) -> Option<&StoryFile> {
        self.stories
            .values()
            .flat_map(|r| r.files.iter())
            .find(|f| matches(*f))
    }

    /// Newly attached tags and every linked story must exist
    fn check_story_links(&self, story: &Story) -> Result<()> {
        let current = self.stories.get(&story.id()).map(|r| r.story.tags());
        if let Some(missing) = story
            .tags()
            .iter()
            .filter(|id| current.map_or(true, |tags| !tags.contains(*id)))
            .find(|id| !self.graph.contains_tag(**id))
        {
            return Err(CatalogError::missing("tag", missing));
        }

        if let Some(missing) = story
            .sequels()
            .iter()
            .chain(story.prequels())
            .find(|id| !self.stories.contains_key(*id))
        {
            return Err(CatalogError::missing("story", missing));
        }
        Ok(())
    }
}

/// JSON files backend implementation
pub struct JsonBackend {
    layout: ArchiveLayout,
    tag_tree: JsonFile,
    tag_codec: VersionedJson<TagTree>,
    story_codec: VersionedJson<StoryRecord>,
    state: Mutex<CatalogState>,
}

impl JsonBackend {
    /// Opens the archive at `root`, creating its directories if needed
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let layout = ArchiveLayout::new(root);
        layout.ensure_dirs()?;

        let tag_codec = tag_tree_codec()?;
        let story_codec: VersionedJson<StoryRecord> = VersionedJson::new(STORY_RECORD_VERSION, Vec::new())?;
        let tag_tree = JsonFile::new(layout.tag_tree_path());

        let graph = match tag_tree.load(&tag_codec)? {
            Some(tree) => TagGraph::from_parts(tree.categories, tree.tags),
            None => TagGraph::new(),
        };

        let mut stories = BTreeMap::new();
        for id in layout.story_ids()? {
            let file = JsonFile::new(layout.story_record_path(id));
            match file.load(&story_codec)? {
                Some(record) if record.story.id() == id => {
                    stories.insert(id, record);
                }
                Some(record) => log::warn!(
                    "skipping story record {} stored under directory {}",
                    record.story.id(),
                    id
                ),
                None => log::debug!("story directory {} has no record", id),
            }
        }

        log::debug!(
            "opened JSON catalog at {:?}: {} tag(s), {} story record(s)",
            layout.root(),
            graph.tags().len(),
            stories.len()
        );

        Ok(Self {
            layout,
            tag_tree,
            tag_codec,
            story_codec,
            state: Mutex::new(CatalogState { graph, stories }),
        })
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    fn lock(&self) -> Result<MutexGuard<'_, CatalogState>> {
        self.state
            .lock()
            .map_err(|_| CatalogError::poisoned("catalog state"))
    }

    /// Applies `f` to a copy of the graph and persists it if anything changed
    fn update_graph<T>(&self, f: impl FnOnce(&mut TagGraph) -> Result<T>) -> Result<T> {
        let mut state = self.lock()?;
        let mut graph = state.graph.clone();
        let value = f(&mut graph)?;
        if graph != state.graph {
            self.tag_tree
                .save(&self.tag_codec, &TagTree::from_graph(&graph))?;
            state.graph = graph;
        }
        Ok(value)
    }

    fn save_records(
        &self,
        state: &mut CatalogState,
        changed: BTreeMap<StoryId, StoryRecord>,
    ) -> Result<()> {
        for (id, record) in &changed {
            JsonFile::new(self.layout.story_record_path(*id)).save(&self.story_codec, record)?;
        }
        state.stories.extend(changed);
        Ok(())
    }

    /// Writes the story and moves the sequel links of every story that now
    /// gains or loses it as a prequel
    fn write_story(&self, state: &mut CatalogState, story: &Story) -> Result<()> {
        let id = story.id();
        let mut changed = BTreeMap::new();

        for (other, record) in &state.stories {
            if *other == id {
                continue;
            }
            let linked = record.story.sequels().contains(&id);
            let wanted = story.prequels().contains(other);
            if linked != wanted {
                let updated = record.story.edit(|d| {
                    if wanted {
                        d.sequels.insert(id);
                    } else {
                        d.sequels.remove(&id);
                    }
                })?;
                changed.insert(
                    *other,
                    StoryRecord {
                        story: updated,
                        files: record.files.clone(),
                    },
                );
            }
        }

        let files = state
            .stories
            .get(&id)
            .map(|r| r.files.clone())
            .unwrap_or_default();
        let stored = story.edit(|d| {
            d.prequels.clear();
            d.files.clear();
        })?;
        changed.insert(id, StoryRecord { story: stored, files });

        self.save_records(state, changed)
    }
}

impl TagRepository for JsonBackend {
    fn get_category(&self, id: CategoryId) -> Result<Option<TagCategory>> {
        Ok(self.lock()?.graph.category(id).cloned())
    }

    fn get_category_by_name(&self, name: &str) -> Result<Option<TagCategory>> {
        Ok(self.lock()?.graph.category_by_name(name).cloned())
    }

    fn list_categories(&self) -> Result<Vec<TagCategory>> {
        Ok(self.lock()?.graph.categories().into_iter().cloned().collect())
    }

    fn create_category(&self, category: &TagCategory) -> Result<()> {
        self.update_graph(|graph| graph.create_category(category.clone()))
    }

    fn update_category(&self, category: &TagCategory) -> Result<()> {
        self.update_graph(|graph| graph.update_category(category.clone()).map(|_| ()))
    }

    fn delete_category(&self, id: CategoryId) -> Result<()> {
        self.update_graph(|graph| graph.delete_category(id).map(|_| ()))
    }

    fn change_category(&self, from: CategoryId, to: CategoryId) -> Result<usize> {
        self.update_graph(|graph| graph.change_category(from, to))
    }

    fn get_tag(&self, id: TagId) -> Result<Option<Tag>> {
        Ok(self.lock()?.graph.tag(id).cloned())
    }

    fn get_tag_by_name(&self, name: &str) -> Result<Option<Tag>> {
        Ok(self.lock()?.graph.tag_by_name(name).cloned())
    }

    fn list_tags(&self) -> Result<Vec<Tag>> {
        Ok(self.lock()?.graph.tags().into_iter().cloned().collect())
    }

    fn tags_in_category(&self, category: CategoryId) -> Result<Vec<Tag>> {
        Ok(self
            .lock()?
            .graph
            .tags_in_category(category)
            .into_iter()
            .cloned()
            .collect())
    }

    fn tags_in_category_including_implied(&self, category: CategoryId) -> Result<Vec<Tag>> {
        Ok(self
            .lock()?
            .graph
            .tags_in_category_including_implied(category)
            .into_iter()
            .cloned()
            .collect())
    }

    fn implying_tags(&self, tag: TagId) -> Result<Vec<Tag>> {
        Ok(self
            .lock()?
            .graph
            .implying_tags(tag)
            .into_iter()
            .cloned()
            .collect())
    }

    fn create_tag(&self, tag: &Tag) -> Result<()> {
        self.update_graph(|graph| graph.create_tag(tag.clone()))
    }

    fn update_tag(&self, tag: &Tag) -> Result<()> {
        self.update_graph(|graph| graph.update_tag(tag.clone()).map(|_| ()))
    }

    fn delete_tag(&self, id: TagId) -> Result<()> {
        self.update_graph(|graph| graph.delete_tag(id).map(|_| ()))
    }

    fn tag_graph(&self) -> Result<TagGraph> {
        Ok(self.lock()?.graph.clone())
    }

    fn existing_tags(&self, ids: &BTreeSet<TagId>) -> Result<BTreeSet<TagId>> {
        let state = self.lock()?;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| state.graph.contains_tag(*id))
            .collect())
    }

    fn resolve_implied(&self, explicit: &BTreeSet<TagId>) -> Result<BTreeSet<TagId>> {
        Ok(self
            .lock()?
            .graph
            .implied_closure(explicit.iter().copied()))
    }
}

impl StoryRepository for JsonBackend {
    fn list_stories(&self) -> Result<Vec<Story>> {
        let state = self.lock()?;
        let prequels = state.prequel_index();
        let mut stories = state
            .stories
            .values()
            .map(|record| state.hydrate(record, &prequels))
            .collect::<Result<Vec<_>>>()?;
        stories.sort_by(|a, b| a.created().cmp(&b.created()).then(a.id().cmp(&b.id())));
        Ok(stories)
    }

    fn get_story(&self, id: StoryId) -> Result<Option<Story>> {
        let state = self.lock()?;
        match state.stories.get(&id) {
            Some(record) => Ok(Some(state.hydrate(record, &state.prequel_index())?)),
            None => Ok(None),
        }
    }

    fn create_story(&self, story: &Story) -> Result<()> {
        let mut state = self.lock()?;
        if state.stories.contains_key(&story.id()) {
            return Err(CatalogError::conflict("story id", story.id().to_string()));
        }
        state.check_story_links(story)?;
        self.write_story(&mut state, story)
    }

    fn update_story(&self, story: &Story) -> Result<()> {
        let mut state = self.lock()?;
        if !state.stories.contains_key(&story.id()) {
            return Ok(());
        }
        state.check_story_links(story)?;
        self.write_story(&mut state, story)
    }

    fn delete_story(&self, id: StoryId) -> Result<()> {
        let mut state = self.lock()?;
        if !state.stories.contains_key(&id) {
            return Ok(());
        }

        let mut changed = BTreeMap::new();
        for (other, record) in &state.stories {
            if *other != id && record.story.sequels().contains(&id) {
                let updated = record.story.edit(|d| {
                    d.sequels.remove(&id);
                })?;
                changed.insert(
                    *other,
                    StoryRecord {
                        story: updated,
                        files: record.files.clone(),
                    },
                );
            }
        }
        self.save_records(&mut state, changed)?;

        JsonFile::new(self.layout.story_record_path(id)).remove()?;
        state.stories.remove(&id);
        Ok(())
    }

    fn add_file(&self, file: &StoryFile) -> Result<()> {
        let mut state = self.lock()?;
        let Some(record) = state.stories.get(&file.story_id()) else {
            return Err(CatalogError::missing("story", file.story_id()));
        };
        if state.find_file(|f| f.id() == file.id()).is_some() {
            return Err(CatalogError::conflict("file id", file.id().to_string()));
        }
        if state.find_file(|f| f.file_name() == file.file_name()).is_some() {
            return Err(CatalogError::conflict("file name", file.file_name()));
        }

        let mut record = record.clone();
        record.files.push(file.clone());
        self.save_records(&mut state, BTreeMap::from([(file.story_id(), record)]))
    }

    fn get_file(&self, id: StoryFileId) -> Result<Option<StoryFile>> {
        Ok(self.lock()?.find_file(|f| f.id() == id).cloned())
    }

    fn get_file_by_name(&self, file_name: &str) -> Result<Option<StoryFile>> {
        Ok(self
            .lock()?
            .find_file(|f| f.file_name() == file_name)
            .cloned())
    }

    fn files_for_story(&self, story: StoryId) -> Result<Vec<StoryFile>> {
        let state = self.lock()?;
        let mut files = state
            .stories
            .get(&story)
            .map(|r| r.files.clone())
            .unwrap_or_default();
        files.sort_by(|a, b| a.file_name().cmp(b.file_name()));
        Ok(files)
    }

    fn list_files(&self) -> Result<Vec<StoryFile>> {
        let state = self.lock()?;
        let mut files: Vec<StoryFile> = state
            .stories
            .values()
            .flat_map(|r| r.files.iter().cloned())
            .collect();
        files.sort_by(|a, b| a.file_name().cmp(b.file_name()));
        Ok(files)
    }

    fn delete_file(&self, id: StoryFileId) -> Result<()> {
        let mut state = self.lock()?;
        let Some(story_id) = state.find_file(|f| f.id() == id).map(StoryFile::story_id) else {
            return Ok(());
        };
        let Some(record) = state.stories.get(&story_id) else {
            return Ok(());
        };

        let mut record = record.clone();
        record.files.retain(|f| f.id() != id);
        self.save_records(&mut state, BTreeMap::from([(story_id, record)]))
    }
}

impl CatalogBackend for JsonBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Json
    }

    fn location(&self) -> &Path {
        self.layout.root()
    }
}
