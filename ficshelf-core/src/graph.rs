//! In-memory tag graph
//!
//! Implication edges may form cycles (mutual implication), so every
//! traversal goes through [`walk`], which visits each node once.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{CatalogError, Result};
use crate::models::{CategoryId, Story, StoryId, Tag, TagCategory, TagId};

/// Breadth-first walk from `seeds` following `neighbors`.
///
/// Returns every reached node, seeds included. A node is expanded at most
/// once, which is what makes cyclic graphs terminate.
pub fn walk<N, F, I>(seeds: impl IntoIterator<Item = N>, mut neighbors: F) -> BTreeSet<N>
where
    N: Ord + Copy,
    F: FnMut(N) -> I,
    I: IntoIterator<Item = N>,
{
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::new();
    for seed in seeds {
        if seen.insert(seed) {
            queue.push_back(seed);
        }
    }
    while let Some(node) = queue.pop_front() {
        for next in neighbors(node) {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

/// Every story reachable from `start` through sequel or prequel links
pub fn story_series(stories: &[Story], start: StoryId) -> BTreeSet<StoryId> {
    let by_id: BTreeMap<StoryId, &Story> = stories.iter().map(|s| (s.id(), s)).collect();
    if !by_id.contains_key(&start) {
        return BTreeSet::new();
    }
    walk([start], |id| {
        by_id
            .get(&id)
            .map(|s| {
                s.sequels()
                    .iter()
                    .chain(s.prequels())
                    .copied()
                    .filter(|next| by_id.contains_key(next))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    })
}

/// Categories and tags held in memory, with the store rules applied on
/// every mutation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagGraph {
    categories: BTreeMap<CategoryId, TagCategory>,
    tags: BTreeMap<TagId, Tag>,
}

impl TagGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from already persisted records without re-checking
    /// cross-entity rules
    pub fn from_parts(
        categories: impl IntoIterator<Item = TagCategory>,
        tags: impl IntoIterator<Item = Tag>,
    ) -> Self {
        Self {
            categories: categories.into_iter().map(|c| (c.id(), c)).collect(),
            tags: tags.into_iter().map(|t| (t.id(), t)).collect(),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Categories ordered by sort order, then name
    pub fn categories(&self) -> Vec<&TagCategory> {
        let mut categories: Vec<_> = self.categories.values().collect();
        categories.sort_by(|a, b| {
            a.sort_order()
                .cmp(&b.sort_order())
                .then_with(|| a.name().cmp(b.name()))
        });
        categories
    }

    pub fn category(&self, id: CategoryId) -> Option<&TagCategory> {
        self.categories.get(&id)
    }

    pub fn category_by_name(&self, name: &str) -> Option<&TagCategory> {
        self.categories.values().find(|c| c.name() == name)
    }

    /// Tags ordered by name
    pub fn tags(&self) -> Vec<&Tag> {
        sorted_by_name(self.tags.values())
    }

    pub fn tag(&self, id: TagId) -> Option<&Tag> {
        self.tags.get(&id)
    }

    pub fn tag_by_name(&self, name: &str) -> Option<&Tag> {
        self.tags.values().find(|t| t.name() == name)
    }

    pub fn contains_tag(&self, id: TagId) -> bool {
        self.tags.contains_key(&id)
    }

    pub fn tags_in_category(&self, category: CategoryId) -> Vec<&Tag> {
        sorted_by_name(self.tags.values().filter(|t| t.category_id() == category))
    }

    /// Tags that list `id` among their implied tags
    pub fn implying_tags(&self, id: TagId) -> Vec<&Tag> {
        sorted_by_name(self.tags.values().filter(|t| t.implied_tags().contains(&id)))
    }

    /// `seeds` plus everything they imply, transitively. Unknown ids are dropped.
    pub fn implied_closure(&self, seeds: impl IntoIterator<Item = TagId>) -> BTreeSet<TagId> {
        let known = seeds.into_iter().filter(|id| self.tags.contains_key(id));
        walk(known, |id| {
            self.tags
                .get(&id)
                .map(|t| {
                    t.implied_tags()
                        .iter()
                        .copied()
                        .filter(|next| self.tags.contains_key(next))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        })
    }

    /// `targets` plus every tag that implies one of them, transitively
    pub fn implying_closure(&self, targets: impl IntoIterator<Item = TagId>) -> BTreeSet<TagId> {
        let mut reverse: BTreeMap<TagId, Vec<TagId>> = BTreeMap::new();
        for tag in self.tags.values() {
            for implied in tag.implied_tags() {
                reverse.entry(*implied).or_default().push(tag.id());
            }
        }
        let known = targets.into_iter().filter(|id| self.tags.contains_key(id));
        walk(known, |id| reverse.get(&id).cloned().unwrap_or_default())
    }

    /// Tags in `category` together with every tag whose implications lead
    /// into it. Cycle members appear once.
    pub fn tags_in_category_including_implied(&self, category: CategoryId) -> Vec<&Tag> {
        let direct = self
            .tags
            .values()
            .filter(|t| t.category_id() == category)
            .map(Tag::id);
        let included = self.implying_closure(direct);
        sorted_by_name(included.iter().filter_map(|id| self.tags.get(id)))
    }

    // =========================================================================
    // Category mutations
    // =========================================================================

    pub fn create_category(&mut self, category: TagCategory) -> Result<()> {
        if self.categories.contains_key(&category.id()) {
            return Err(CatalogError::conflict("category id", category.id().to_string()));
        }
        self.check_category_name(&category)?;
        self.categories.insert(category.id(), category);
        Ok(())
    }

    /// Replaces an existing category; returns false when the id is unknown
    pub fn update_category(&mut self, category: TagCategory) -> Result<bool> {
        if !self.categories.contains_key(&category.id()) {
            return Ok(false);
        }
        self.check_category_name(&category)?;
        self.categories.insert(category.id(), category);
        Ok(true)
    }

    /// Removes an unreferenced category; returns false when the id is unknown
    pub fn delete_category(&mut self, id: CategoryId) -> Result<bool> {
        if !self.categories.contains_key(&id) {
            return Ok(false);
        }
        let referencing = self.tags.values().filter(|t| t.category_id() == id).count();
        if referencing > 0 {
            return Err(CatalogError::CategoryInUse {
                id: id.to_string(),
                tags: referencing,
            });
        }
        self.categories.remove(&id);
        Ok(true)
    }

    /// Moves every tag of `from` into `to`, returning how many moved
    pub fn change_category(&mut self, from: CategoryId, to: CategoryId) -> Result<usize> {
        if !self.categories.contains_key(&to) {
            return Err(CatalogError::missing("tag category", to));
        }
        if from == to {
            return Ok(0);
        }
        let mut moved = 0;
        for tag in self.tags.values_mut() {
            if tag.category_id() == from {
                *tag = tag.edit(|d| d.category_id = to)?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn check_category_name(&self, category: &TagCategory) -> Result<()> {
        match self.category_by_name(category.name()) {
            Some(existing) if existing.id() != category.id() => {
                Err(CatalogError::conflict("category name", category.name()))
            }
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Tag mutations
    // =========================================================================

    pub fn create_tag(&mut self, tag: Tag) -> Result<()> {
        if self.tags.contains_key(&tag.id()) {
            return Err(CatalogError::conflict("tag id", tag.id().to_string()));
        }
        self.check_tag(&tag)?;
        self.tags.insert(tag.id(), tag);
        Ok(())
    }

    /// Replaces an existing tag; returns false when the id is unknown
    pub fn update_tag(&mut self, tag: Tag) -> Result<bool> {
        if !self.tags.contains_key(&tag.id()) {
            return Ok(false);
        }
        self.check_tag(&tag)?;
        self.tags.insert(tag.id(), tag);
        Ok(true)
    }

    /// Removes a tag and every implication edge pointing at it
    pub fn delete_tag(&mut self, id: TagId) -> Result<bool> {
        if self.tags.remove(&id).is_none() {
            return Ok(false);
        }
        for tag in self.tags.values_mut() {
            if tag.implied_tags().contains(&id) {
                *tag = tag.edit(|d| {
                    d.implied_tags.remove(&id);
                })?;
            }
        }
        Ok(true)
    }

    fn check_tag(&self, tag: &Tag) -> Result<()> {
        if !self.categories.contains_key(&tag.category_id()) {
            return Err(CatalogError::missing("tag category", tag.category_id()));
        }
        if let Some(missing) = tag
            .implied_tags()
            .iter()
            .find(|id| !self.tags.contains_key(id))
        {
            return Err(CatalogError::missing("tag", missing));
        }
        match self.tag_by_name(tag.name()) {
            Some(existing) if existing.id() != tag.id() => {
                Err(CatalogError::conflict("tag name", tag.name()))
            }
            _ => Ok(()),
        }
    }
}

fn sorted_by_name<'a>(tags: impl Iterator<Item = &'a Tag>) -> Vec<&'a Tag> {
    let mut tags: Vec<_> = tags.collect();
    tags.sort_by(|a, b| a.name().cmp(b.name()));
    tags
}
