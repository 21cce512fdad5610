//! Behaviour every catalog backend must share
//!
//! A backend's test module instantiates the whole suite with
//! `backend_conformance!(open_fn)`, where `open_fn(&Path)` opens a fresh
//! backend rooted in a temporary directory.

use std::collections::BTreeSet;

use chrono::{Duration, TimeZone, Utc};

use crate::error::CatalogError;
use crate::models::{
    CategoryDraft, CategoryId, Color, FileFormat, Score, Story, StoryDraft, StoryFile,
    StoryFileDraft, StoryFileId, StoryId, Tag, TagCategory, TagDraft, TagId,
};

use super::CatalogBackend;

macro_rules! backend_conformance {
    ($open:ident) => {
        fn run_conformance(check: fn(&dyn $crate::db::CatalogBackend)) {
            let dir = tempfile::TempDir::new().unwrap();
            let backend = $open(dir.path());
            check(&backend);
        }

        #[test]
        fn conformance_missing_category_is_rejected() {
            run_conformance($crate::db::conformance::missing_category_is_rejected);
        }

        #[test]
        fn conformance_names_are_unique() {
            run_conformance($crate::db::conformance::names_are_unique);
        }

        #[test]
        fn conformance_implication_cycles_are_included_once() {
            run_conformance($crate::db::conformance::implication_cycles_are_included_once);
        }

        #[test]
        fn conformance_including_implied_follows_chains() {
            run_conformance($crate::db::conformance::including_implied_follows_chains);
        }

        #[test]
        fn conformance_category_delete_requires_reassignment() {
            run_conformance($crate::db::conformance::category_delete_requires_reassignment);
        }

        #[test]
        fn conformance_categories_are_ordered() {
            run_conformance($crate::db::conformance::categories_are_ordered);
        }

        #[test]
        fn conformance_unknown_ids_are_no_ops() {
            run_conformance($crate::db::conformance::unknown_ids_are_no_ops);
        }

        #[test]
        fn conformance_story_round_trip() {
            run_conformance($crate::db::conformance::story_round_trip);
        }

        #[test]
        fn conformance_sequel_links_are_symmetric() {
            run_conformance($crate::db::conformance::sequel_links_are_symmetric);
        }

        #[test]
        fn conformance_story_links_must_exist() {
            run_conformance($crate::db::conformance::story_links_must_exist);
        }

        #[test]
        fn conformance_deleted_tags_dangle_on_stories() {
            run_conformance($crate::db::conformance::deleted_tags_dangle_on_stories);
        }

        #[test]
        fn conformance_file_names_are_unique_per_archive() {
            run_conformance($crate::db::conformance::file_names_are_unique_per_archive);
        }

        #[test]
        fn conformance_stats_count_entities() {
            run_conformance($crate::db::conformance::stats_count_entities);
        }
    };
}

pub(crate) use backend_conformance;

fn category(backend: &dyn CatalogBackend, name: &str) -> TagCategory {
    let category = TagCategory::new(CategoryDraft::new(name)).unwrap();
    backend.create_category(&category).unwrap();
    category
}

fn tag(backend: &dyn CatalogBackend, name: &str, category: CategoryId, implied: &[TagId]) -> Tag {
    let mut draft = TagDraft::new(name, category);
    draft.implied_tags.extend(implied.iter().copied());
    let tag = Tag::new(draft).unwrap();
    backend.create_tag(&tag).unwrap();
    tag
}

fn story(backend: &dyn CatalogBackend, name: &str) -> Story {
    let story = Story::new(StoryDraft::new(name)).unwrap();
    backend.create_story(&story).unwrap();
    story
}

fn file(story: StoryId, name: &str) -> StoryFile {
    StoryFile::new(StoryFileDraft {
        id: StoryFileId::new(),
        story_id: story,
        format: FileFormat::for_file_name(name),
        file_name: name.to_string(),
        sha256: "ab".repeat(32),
        word_count: 1_200,
        size: 6_400,
    })
    .unwrap()
}

fn names(tags: &[Tag]) -> Vec<&str> {
    tags.iter().map(Tag::name).collect()
}

fn reload(backend: &dyn CatalogBackend, id: StoryId) -> Story {
    backend.get_story(id).unwrap().unwrap()
}

pub(crate) fn missing_category_is_rejected(backend: &dyn CatalogBackend) {
    let orphan = Tag::new(TagDraft::new("Orphan", CategoryId::new())).unwrap();
    assert!(matches!(
        backend.create_tag(&orphan),
        Err(CatalogError::Referential { entity: "tag category", .. })
    ));
    assert!(backend.get_tag(orphan.id()).unwrap().is_none());

    let genre = category(backend, "Genre");
    let mystery = tag(backend, "Mystery", genre.id(), &[]);
    let moved = mystery.edit(|d| d.category_id = CategoryId::new()).unwrap();
    assert!(matches!(
        backend.update_tag(&moved),
        Err(CatalogError::Referential { entity: "tag category", .. })
    ));

    let dangling = Tag::new({
        let mut draft = TagDraft::new("Dangling", genre.id());
        draft.implied_tags.insert(TagId::new());
        draft
    })
    .unwrap();
    assert!(matches!(
        backend.create_tag(&dangling),
        Err(CatalogError::Referential { entity: "tag", .. })
    ));
    assert_eq!(backend.get_tag(mystery.id()).unwrap(), Some(mystery));
}

pub(crate) fn names_are_unique(backend: &dyn CatalogBackend) {
    let genre = category(backend, "Genre");
    let mystery = tag(backend, "Mystery", genre.id(), &[]);
    let romance = tag(backend, "Romance", genre.id(), &[]);

    let duplicate = Tag::new(TagDraft::new("Mystery", genre.id())).unwrap();
    assert!(matches!(
        backend.create_tag(&duplicate),
        Err(CatalogError::Conflict { field: "tag name", .. })
    ));

    let clash = romance.edit(|d| d.name = "Mystery".into()).unwrap();
    assert!(matches!(
        backend.update_tag(&clash),
        Err(CatalogError::Conflict { field: "tag name", .. })
    ));

    // keeping its own name is not a collision
    let same = mystery
        .edit(|d| d.description = Some("Whodunits".into()))
        .unwrap();
    backend.update_tag(&same).unwrap();
    assert_eq!(backend.get_tag(mystery.id()).unwrap(), Some(same));

    assert!(backend.get_tag_by_name("mystery").unwrap().is_none());
    assert_eq!(
        backend.get_tag_by_name("Romance").unwrap().map(|t| t.id()),
        Some(romance.id())
    );

    let duplicate = TagCategory::new(CategoryDraft::new("Genre")).unwrap();
    assert!(matches!(
        backend.create_category(&duplicate),
        Err(CatalogError::Conflict { field: "category name", .. })
    ));
}

pub(crate) fn implication_cycles_are_included_once(backend: &dyn CatalogBackend) {
    let genre = category(backend, "Genre");
    let mood = category(backend, "Mood");
    let a = tag(backend, "A", genre.id(), &[]);
    let b = tag(backend, "B", mood.id(), &[a.id()]);
    let a = a.edit(|d| {
        d.implied_tags.insert(b.id());
    })
    .unwrap();
    backend.update_tag(&a).unwrap();

    for cat in [genre.id(), mood.id()] {
        let tags = backend.tags_in_category_including_implied(cat).unwrap();
        assert_eq!(names(&tags), vec!["A", "B"]);
    }

    assert_eq!(
        backend.resolve_implied(&BTreeSet::from([a.id()])).unwrap(),
        BTreeSet::from([a.id(), b.id()])
    );
    assert_eq!(names(&backend.implying_tags(a.id()).unwrap()), vec!["B"]);
}

pub(crate) fn including_implied_follows_chains(backend: &dyn CatalogBackend) {
    let setting = category(backend, "Setting");
    let other = category(backend, "Other");
    let space = tag(backend, "Space", setting.id(), &[]);
    let station = tag(backend, "Space Station", other.id(), &[space.id()]);
    tag(backend, "Docking Bay", other.id(), &[station.id()]);
    tag(backend, "Cafe", other.id(), &[]);

    assert_eq!(
        names(&backend.tags_in_category(setting.id()).unwrap()),
        vec!["Space"]
    );
    assert_eq!(
        names(&backend.tags_in_category_including_implied(setting.id()).unwrap()),
        vec!["Docking Bay", "Space", "Space Station"]
    );
    assert_eq!(
        names(&backend.implying_tags(space.id()).unwrap()),
        vec!["Space Station"]
    );

    let graph = backend.tag_graph().unwrap();
    assert_eq!(graph.tags().len(), 4);
    assert_eq!(graph.categories().len(), 2);
}

pub(crate) fn category_delete_requires_reassignment(backend: &dyn CatalogBackend) {
    let old = category(backend, "Old");
    let new = category(backend, "New");
    tag(backend, "One", old.id(), &[]);
    tag(backend, "Two", old.id(), &[]);

    assert!(matches!(
        backend.delete_category(old.id()),
        Err(CatalogError::CategoryInUse { tags: 2, .. })
    ));

    assert_eq!(backend.change_category(old.id(), new.id()).unwrap(), 2);
    backend.delete_category(old.id()).unwrap();
    assert!(backend.get_category(old.id()).unwrap().is_none());
    assert_eq!(backend.tags_in_category(new.id()).unwrap().len(), 2);

    assert!(matches!(
        backend.change_category(new.id(), old.id()),
        Err(CatalogError::Referential { entity: "tag category", .. })
    ));
    assert_eq!(backend.change_category(new.id(), new.id()).unwrap(), 0);
}

pub(crate) fn categories_are_ordered(backend: &dyn CatalogBackend) {
    let with_order = |name: &str, sort_order: i32| {
        let mut draft = CategoryDraft::new(name);
        draft.sort_order = sort_order;
        draft.color = Color::from_rgb(0x12, 0x34, 0x56);
        let category = TagCategory::new(draft).unwrap();
        backend.create_category(&category).unwrap();
        category
    };
    let beta = with_order("Beta", 1);
    with_order("Alpha", 1);
    with_order("Zeta", 0);

    let listed: Vec<_> = backend
        .list_categories()
        .unwrap()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    assert_eq!(listed, vec!["Zeta", "Alpha", "Beta"]);

    let moved = beta
        .edit(|d| {
            d.sort_order = -1;
            d.description = Some("First now".into());
        })
        .unwrap();
    backend.update_category(&moved).unwrap();
    assert_eq!(backend.get_category_by_name("Beta").unwrap(), Some(moved));
    assert_eq!(
        backend.list_categories().unwrap()[0].color(),
        Color::from_rgb(0x12, 0x34, 0x56)
    );
}

pub(crate) fn unknown_ids_are_no_ops(backend: &dyn CatalogBackend) {
    let genre = category(backend, "Genre");

    let ghost = Tag::new(TagDraft::new("Ghost", genre.id())).unwrap();
    backend.update_tag(&ghost).unwrap();
    assert!(backend.get_tag(ghost.id()).unwrap().is_none());
    backend.delete_tag(TagId::new()).unwrap();

    let ghost = TagCategory::new(CategoryDraft::new("Ghost")).unwrap();
    backend.update_category(&ghost).unwrap();
    assert!(backend.get_category_by_name("Ghost").unwrap().is_none());
    backend.delete_category(CategoryId::new()).unwrap();

    let ghost = Story::new(StoryDraft::new("Ghost")).unwrap();
    backend.update_story(&ghost).unwrap();
    assert!(backend.get_story(ghost.id()).unwrap().is_none());
    backend.delete_story(StoryId::new()).unwrap();
    backend.delete_file(StoryFileId::new()).unwrap();

    assert_eq!(backend.list_categories().unwrap().len(), 1);
    assert!(backend.list_stories().unwrap().is_empty());
}

pub(crate) fn story_round_trip(backend: &dyn CatalogBackend) {
    let genre = category(backend, "Genre");
    let mystery = tag(backend, "Mystery", genre.id(), &[]);

    let created = Utc.with_ymd_and_hms(2020, 5, 17, 12, 30, 0).unwrap();
    let mut draft = StoryDraft::new("The Long Night");
    draft.author = Some("A. Writer".into());
    draft.url = Some("https://example.org/s/123".into());
    draft.description = Some("A detective, a storm, a locked room.".into());
    draft.created = created;
    draft.updated = created + Duration::days(3);
    draft.tags.insert(mystery.id());
    draft.score = Some(Score::new(0.8).unwrap());
    draft.review = Some("Tense.".into());
    draft.first_read = Some(created + Duration::days(10));
    draft.last_read = Some(created + Duration::days(40));
    draft.times_read = 2;
    let story = Story::new(draft).unwrap();

    backend.create_story(&story).unwrap();
    assert_eq!(backend.get_story(story.id()).unwrap(), Some(story.clone()));
    assert_eq!(backend.list_stories().unwrap(), vec![story.clone()]);

    assert!(matches!(
        backend.create_story(&story),
        Err(CatalogError::Conflict { field: "story id", .. })
    ));

    let renamed = story
        .edit(|d| {
            d.name = "The Longest Night".into();
            d.score = None;
            d.times_read = 3;
        })
        .unwrap();
    backend.update_story(&renamed).unwrap();
    assert_eq!(backend.get_story(story.id()).unwrap(), Some(renamed));

    backend.delete_story(story.id()).unwrap();
    assert!(backend.get_story(story.id()).unwrap().is_none());
    assert!(backend.list_stories().unwrap().is_empty());
}

pub(crate) fn sequel_links_are_symmetric(backend: &dyn CatalogBackend) {
    let a = story(backend, "A");
    let b = story(backend, "B");
    let c = story(backend, "C");

    let a_next = a.edit(|d| {
        d.sequels.insert(b.id());
    })
    .unwrap();
    backend.update_story(&a_next).unwrap();
    assert_eq!(reload(backend, b.id()).prequels(), &BTreeSet::from([a.id()]));
    assert_eq!(reload(backend, a.id()).sequels(), &BTreeSet::from([b.id()]));

    // mutual sequels form a cycle and are accepted
    let b_next = reload(backend, b.id())
        .edit(|d| {
            d.sequels.insert(a.id());
        })
        .unwrap();
    backend.update_story(&b_next).unwrap();
    let a_now = reload(backend, a.id());
    assert_eq!(a_now.prequels(), &BTreeSet::from([b.id()]));
    assert_eq!(a_now.sequels(), &BTreeSet::from([b.id()]));

    // a link written from the prequel side shows up on the other story
    let c_next = c
        .edit(|d| {
            d.prequels.insert(a.id());
        })
        .unwrap();
    backend.update_story(&c_next).unwrap();
    assert_eq!(
        reload(backend, a.id()).sequels(),
        &BTreeSet::from([b.id(), c.id()])
    );

    let a_less = reload(backend, a.id())
        .edit(|d| {
            d.sequels.remove(&b.id());
        })
        .unwrap();
    backend.update_story(&a_less).unwrap();
    let b_now = reload(backend, b.id());
    assert!(b_now.prequels().is_empty());
    assert_eq!(b_now.sequels(), &BTreeSet::from([a.id()]));
    assert_eq!(reload(backend, a.id()).prequels(), &BTreeSet::from([b.id()]));

    let series: BTreeSet<_> = backend
        .series(c.id())
        .unwrap()
        .iter()
        .map(Story::id)
        .collect();
    assert_eq!(series, BTreeSet::from([a.id(), b.id(), c.id()]));

    backend.delete_story(a.id()).unwrap();
    assert!(reload(backend, b.id()).sequels().is_empty());
    assert!(reload(backend, c.id()).prequels().is_empty());
}

pub(crate) fn story_links_must_exist(backend: &dyn CatalogBackend) {
    let mut draft = StoryDraft::new("Tagged");
    draft.tags.insert(TagId::new());
    let err = backend.create_story(&Story::new(draft).unwrap()).unwrap_err();
    assert!(matches!(err, CatalogError::Referential { entity: "tag", .. }));

    let mut draft = StoryDraft::new("Linked");
    draft.prequels.insert(StoryId::new());
    let err = backend.create_story(&Story::new(draft).unwrap()).unwrap_err();
    assert!(matches!(err, CatalogError::Referential { entity: "story", .. }));

    assert!(backend.list_stories().unwrap().is_empty());
}

pub(crate) fn deleted_tags_dangle_on_stories(backend: &dyn CatalogBackend) {
    let genre = category(backend, "Genre");
    let gone = tag(backend, "Gone", genre.id(), &[]);
    let kept = tag(backend, "Kept", genre.id(), &[]);
    let implying = tag(backend, "Implying", genre.id(), &[gone.id()]);

    let mut draft = StoryDraft::new("Tagged");
    draft.tags = BTreeSet::from([gone.id(), kept.id()]);
    let tagged = Story::new(draft).unwrap();
    backend.create_story(&tagged).unwrap();

    backend.delete_tag(gone.id()).unwrap();
    assert!(backend.get_tag(gone.id()).unwrap().is_none());
    assert!(backend
        .get_tag(implying.id())
        .unwrap()
        .unwrap()
        .implied_tags()
        .is_empty());

    let stored = reload(backend, tagged.id());
    assert_eq!(stored.tags(), tagged.tags());
    assert_eq!(
        backend.existing_tags(stored.tags()).unwrap(),
        BTreeSet::from([kept.id()])
    );
    assert_eq!(
        backend.resolve_implied(stored.tags()).unwrap(),
        BTreeSet::from([kept.id()])
    );

    // the dangling reference does not block unrelated edits
    let renamed = stored.edit(|d| d.name = "Renamed".into()).unwrap();
    backend.update_story(&renamed).unwrap();

    let attached = renamed
        .edit(|d| {
            d.tags.insert(TagId::new());
        })
        .unwrap();
    assert!(matches!(
        backend.update_story(&attached),
        Err(CatalogError::Referential { entity: "tag", .. })
    ));
}

pub(crate) fn file_names_are_unique_per_archive(backend: &dyn CatalogBackend) {
    let first = story(backend, "First");
    let second = story(backend, "Second");

    let chapter = file(first.id(), "chapter1.txt");
    backend.add_file(&chapter).unwrap();

    assert!(matches!(
        backend.add_file(&file(second.id(), "chapter1.txt")),
        Err(CatalogError::Conflict { field: "file name", .. })
    ));
    assert!(matches!(
        backend.add_file(&file(StoryId::new(), "orphan.txt")),
        Err(CatalogError::Referential { entity: "story", .. })
    ));

    assert_eq!(backend.get_file(chapter.id()).unwrap(), Some(chapter.clone()));
    assert_eq!(
        backend.get_file_by_name("chapter1.txt").unwrap(),
        Some(chapter.clone())
    );
    assert_eq!(backend.files_for_story(first.id()).unwrap(), vec![chapter.clone()]);
    assert_eq!(
        reload(backend, first.id()).files(),
        &BTreeSet::from([chapter.id()])
    );

    // the files set is derived, writes ignore it
    let cleared = reload(backend, first.id())
        .edit(|d| d.files.clear())
        .unwrap();
    backend.update_story(&cleared).unwrap();
    assert_eq!(
        reload(backend, first.id()).files(),
        &BTreeSet::from([chapter.id()])
    );

    let appendix = file(second.id(), "appendix.txt");
    backend.add_file(&appendix).unwrap();
    assert_eq!(
        backend.list_files().unwrap(),
        vec![appendix.clone(), chapter.clone()]
    );
    backend.delete_file(appendix.id()).unwrap();

    backend.delete_file(chapter.id()).unwrap();
    assert!(backend.files_for_story(first.id()).unwrap().is_empty());
    assert!(reload(backend, first.id()).files().is_empty());

    let epub = file(second.id(), "book.epub");
    backend.add_file(&epub).unwrap();
    backend.delete_story(second.id()).unwrap();
    assert!(backend.get_file(epub.id()).unwrap().is_none());
}

pub(crate) fn stats_count_entities(backend: &dyn CatalogBackend) {
    let genre = category(backend, "Genre");
    tag(backend, "Mystery", genre.id(), &[]);
    story(backend, "One");
    story(backend, "Two");

    let stats = backend.stats().unwrap();
    assert_eq!(stats.category_count, 1);
    assert_eq!(stats.tag_count, 1);
    assert_eq!(stats.story_count, 2);
    assert_eq!(stats.backend_type, backend.backend_type());
}
