pub mod archive;
pub mod db;
pub mod error;
pub mod graph;
pub mod import;
pub mod mapping;
pub mod models;
pub mod settings;
pub mod storage;
pub mod versioned;

// Re-export commonly used types
pub use archive::ArchiveLayout;
pub use db::{
    create_backend, infer_backend_type, BackendType, CatalogBackend, CatalogStats, JsonBackend,
    SqliteBackend, StoryRepository, TagRepository,
};
pub use error::{CatalogError, MigrationError, Result, ValidationError};
pub use graph::TagGraph;
pub use import::{
    ImportOptions, ImportOutcome, ImportedCover, ImportedFile, ImportedStory, Importer,
    MetadataProvider, ProviderRegistry,
};
pub use mapping::{normalize_tag_name, TagMappingCache};
pub use models::{
    CategoryDraft, CategoryId, Color, CoverFormat, FileFormat, Score, Story, StoryDraft,
    StoryFile, StoryFileDraft, StoryFileId, StoryId, Tag, TagCategory, TagDraft, TagId,
};
pub use settings::{FileSettingsBackend, Settings, SettingsBackend, SettingsService};
pub use versioned::{Migration, VersionedJson};
