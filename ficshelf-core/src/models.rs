//! Catalog entities and bounded value types
//!
//! Validated entities (`TagCategory`, `Tag`, `Story`, `StoryFile`) wrap a
//! plain draft struct. The only way to obtain one is through `new`, `edit`
//! or deserialization, and each of those runs the same checks, so an
//! invalid value never reaches a store.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Maximum length of tag and category names
pub const NAME_MAX: usize = 100;
/// Maximum length of tag and category descriptions
pub const DESCRIPTION_MAX: usize = 2_000;
/// Maximum length of a story's author, name and url
pub const STORY_TEXT_MAX: usize = 1_000;
/// Maximum length of a story's description and review
pub const LONG_TEXT_MAX: usize = 20_000;
/// Maximum length of a stored file name
pub const FILE_NAME_MAX: usize = 255;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

entity_id!(
    /// Identifier of a tag category
    CategoryId
);
entity_id!(
    /// Identifier of a tag
    TagId
);
entity_id!(
    /// Identifier of a story
    StoryId
);
entity_id!(
    /// Identifier of a file attached to a story
    StoryFileId
);

pub(crate) fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    let actual = value.chars().count();
    if actual > max {
        return Err(ValidationError::TooLong { field, max, actual });
    }
    Ok(())
}

fn check_opt_len(
    field: &'static str,
    value: Option<&String>,
    max: usize,
) -> Result<(), ValidationError> {
    value.map_or(Ok(()), |v| check_len(field, v, max))
}

fn check_name(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Invalid {
            field,
            reason: "must not be blank".to_string(),
        });
    }
    check_len(field, value, max)
}

// ============================================================================
// Value types
// ============================================================================

/// A story rating normalized to `[0, 1]`
///
/// Out-of-range input is clamped; NaN is rejected. Rescaling to stars or
/// percentages is left to presentation code.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Score(f64);

impl Score {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if value.is_nan() {
            return Err(ValidationError::Invalid {
                field: "score",
                reason: "not a number".to_string(),
            });
        }
        Ok(Self(value.clamp(0.0, 1.0)))
    }

    /// Builds a score from a rating on a `0..=max` scale
    pub fn from_scale(rating: f64, max: f64) -> Result<Self, ValidationError> {
        if max.is_nan() || max <= 0.0 {
            return Err(ValidationError::Invalid {
                field: "score",
                reason: format!("scale maximum must be positive, got {}", max),
            });
        }
        Self::new(rating / max)
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Score {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Score> for f64 {
    fn from(score: Score) -> Self {
        score.0
    }
}

/// Packed `0xRRGGBB` colour of a tag category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Color(u32);

impl Color {
    pub const MAX: u32 = 0x00FF_FFFF;

    pub fn new(packed: u32) -> Result<Self, ValidationError> {
        if packed > Self::MAX {
            return Err(ValidationError::Invalid {
                field: "color",
                reason: format!("{:#x} is not a packed RGB value", packed),
            });
        }
        Ok(Self(packed))
    }

    pub const fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self(((r as u32) << 16) | ((g as u32) << 8) | b as u32)
    }

    /// Parses `#rrggbb` (the leading `#` is optional)
    pub fn parse_hex(s: &str) -> Result<Self, ValidationError> {
        let digits = s.trim().trim_start_matches('#');
        if digits.len() != 6 {
            return Err(ValidationError::Invalid {
                field: "color",
                reason: format!("expected #rrggbb, got '{}'", s),
            });
        }
        u32::from_str_radix(digits, 16)
            .map_err(|e| ValidationError::Invalid {
                field: "color",
                reason: e.to_string(),
            })
            .and_then(Self::new)
    }

    pub fn packed(self) -> u32 {
        self.0
    }

    pub fn rgb(self) -> (u8, u8, u8) {
        ((self.0 >> 16) as u8, (self.0 >> 8) as u8, self.0 as u8)
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::from_rgb(0x80, 0x80, 0x80)
    }
}

impl TryFrom<u32> for Color {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Color> for u32 {
    fn from(color: Color) -> Self {
        color.0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06x}", self.0)
    }
}

/// Format of a story file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileFormat {
    Txt,
    Epub,
    Pdf,
    Html,
    Other,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "txt" => FileFormat::Txt,
            "epub" => FileFormat::Epub,
            "pdf" => FileFormat::Pdf,
            "html" | "htm" => FileFormat::Html,
            _ => FileFormat::Other,
        }
    }

    pub fn for_file_name(name: &str) -> Self {
        name.rsplit_once('.')
            .map_or(FileFormat::Other, |(_, ext)| Self::from_extension(ext))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Txt => "TXT",
            FileFormat::Epub => "EPUB",
            FileFormat::Pdf => "PDF",
            FileFormat::Html => "HTML",
            FileFormat::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TXT" => Some(FileFormat::Txt),
            "EPUB" => Some(FileFormat::Epub),
            "PDF" => Some(FileFormat::Pdf),
            "HTML" => Some(FileFormat::Html),
            "OTHER" => Some(FileFormat::Other),
            _ => None,
        }
    }

    /// Whether the content is readable text worth counting words in
    pub fn is_text(&self) -> bool {
        matches!(self, FileFormat::Txt | FileFormat::Html)
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image formats accepted as covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverFormat {
    Png,
    Jpeg,
    Webp,
    Bmp,
    Gif,
    Heif,
    Ico,
    Wbmp,
}

impl CoverFormat {
    pub fn from_extension(ext: &str) -> Result<Self, ValidationError> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "png" => Ok(CoverFormat::Png),
            "jpg" | "jpeg" => Ok(CoverFormat::Jpeg),
            "webp" => Ok(CoverFormat::Webp),
            "bmp" => Ok(CoverFormat::Bmp),
            "gif" => Ok(CoverFormat::Gif),
            "heif" | "avif" => Ok(CoverFormat::Heif),
            "ico" => Ok(CoverFormat::Ico),
            "wbmp" => Ok(CoverFormat::Wbmp),
            other => Err(ValidationError::Invalid {
                field: "cover format",
                reason: format!("unsupported extension '{}'", other),
            }),
        }
    }

    /// Extension used for `cover.<ext>` in the archive
    pub fn extension(&self) -> &'static str {
        match self {
            CoverFormat::Png => "png",
            CoverFormat::Jpeg => "jpg",
            CoverFormat::Webp => "webp",
            CoverFormat::Bmp => "bmp",
            CoverFormat::Gif => "gif",
            CoverFormat::Heif => "heif",
            CoverFormat::Ico => "ico",
            CoverFormat::Wbmp => "wbmp",
        }
    }
}

// ============================================================================
// Tag categories
// ============================================================================

/// Unvalidated fields of a [`TagCategory`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryDraft {
    pub id: CategoryId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub color: Color,
}

impl CategoryDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: CategoryId::new(),
            name: name.into(),
            description: None,
            sort_order: 0,
            color: Color::default(),
        }
    }
}

/// A named group of tags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CategoryDraft", into = "CategoryDraft")]
pub struct TagCategory(CategoryDraft);

impl TagCategory {
    pub fn new(draft: CategoryDraft) -> Result<Self, ValidationError> {
        check_name("category name", &draft.name, NAME_MAX)?;
        check_opt_len(
            "category description",
            draft.description.as_ref(),
            DESCRIPTION_MAX,
        )?;
        Ok(Self(draft))
    }

    /// Copies the category with changes applied; the copy is validated again
    pub fn edit(&self, f: impl FnOnce(&mut CategoryDraft)) -> Result<Self, ValidationError> {
        let mut draft = self.0.clone();
        f(&mut draft);
        Self::new(draft)
    }

    pub fn id(&self) -> CategoryId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn description(&self) -> Option<&str> {
        self.0.description.as_deref()
    }

    pub fn sort_order(&self) -> i32 {
        self.0.sort_order
    }

    pub fn color(&self) -> Color {
        self.0.color
    }

    pub fn into_draft(self) -> CategoryDraft {
        self.0
    }
}

impl TryFrom<CategoryDraft> for TagCategory {
    type Error = ValidationError;

    fn try_from(draft: CategoryDraft) -> Result<Self, Self::Error> {
        Self::new(draft)
    }
}

impl From<TagCategory> for CategoryDraft {
    fn from(category: TagCategory) -> Self {
        category.0
    }
}

// ============================================================================
// Tags
// ============================================================================

/// Unvalidated fields of a [`Tag`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDraft {
    pub id: TagId,
    pub name: String,
    pub category_id: CategoryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tags considered present whenever this one is applied
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub implied_tags: BTreeSet<TagId>,
}

impl TagDraft {
    pub fn new(name: impl Into<String>, category_id: CategoryId) -> Self {
        Self {
            id: TagId::new(),
            name: name.into(),
            category_id,
            description: None,
            implied_tags: BTreeSet::new(),
        }
    }
}

/// A tag; implications may form cycles but never point at the tag itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TagDraft", into = "TagDraft")]
pub struct Tag(TagDraft);

impl Tag {
    pub fn new(draft: TagDraft) -> Result<Self, ValidationError> {
        check_name("tag name", &draft.name, NAME_MAX)?;
        check_opt_len("tag description", draft.description.as_ref(), DESCRIPTION_MAX)?;
        if draft.implied_tags.contains(&draft.id) {
            return Err(ValidationError::SelfReference("tag implication"));
        }
        Ok(Self(draft))
    }

    pub fn edit(&self, f: impl FnOnce(&mut TagDraft)) -> Result<Self, ValidationError> {
        let mut draft = self.0.clone();
        f(&mut draft);
        Self::new(draft)
    }

    pub fn id(&self) -> TagId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn category_id(&self) -> CategoryId {
        self.0.category_id
    }

    pub fn description(&self) -> Option<&str> {
        self.0.description.as_deref()
    }

    pub fn implied_tags(&self) -> &BTreeSet<TagId> {
        &self.0.implied_tags
    }

    pub fn into_draft(self) -> TagDraft {
        self.0
    }
}

impl TryFrom<TagDraft> for Tag {
    type Error = ValidationError;

    fn try_from(draft: TagDraft) -> Result<Self, Self::Error> {
        Self::new(draft)
    }
}

impl From<Tag> for TagDraft {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

// ============================================================================
// Stories
// ============================================================================

/// Unvalidated fields of a [`Story`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryDraft {
    pub id: StoryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Explicit tags only; implied tags are resolved by the tag store
    #[serde(default)]
    pub tags: BTreeSet<TagId>,
    #[serde(default)]
    pub sequels: BTreeSet<StoryId>,
    #[serde(default)]
    pub prequels: BTreeSet<StoryId>,
    /// Filled from the story's file records when loaded; ignored on write
    #[serde(default)]
    pub files: BTreeSet<StoryFileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_read: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read: Option<DateTime<Utc>>,
    #[serde(default)]
    pub times_read: u32,
}

impl StoryDraft {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: StoryId::new(),
            author: None,
            name: name.into(),
            url: None,
            description: None,
            created: now,
            updated: now,
            tags: BTreeSet::new(),
            sequels: BTreeSet::new(),
            prequels: BTreeSet::new(),
            files: BTreeSet::new(),
            score: None,
            review: None,
            first_read: None,
            last_read: None,
            times_read: 0,
        }
    }
}

/// A cataloged story
///
/// Sequel and prequel links may form cycles between different stories; a
/// story never lists itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoryDraft", into = "StoryDraft")]
pub struct Story(StoryDraft);

impl Story {
    pub fn new(draft: StoryDraft) -> Result<Self, ValidationError> {
        check_name("story name", &draft.name, STORY_TEXT_MAX)?;
        check_opt_len("story author", draft.author.as_ref(), STORY_TEXT_MAX)?;
        check_opt_len("story url", draft.url.as_ref(), STORY_TEXT_MAX)?;
        check_opt_len(
            "story description",
            draft.description.as_ref(),
            LONG_TEXT_MAX,
        )?;
        check_opt_len("story review", draft.review.as_ref(), LONG_TEXT_MAX)?;

        if draft.updated < draft.created {
            return Err(ValidationError::OutOfOrder {
                earlier: "created",
                later: "updated",
            });
        }
        if let (Some(first), Some(last)) = (draft.first_read, draft.last_read) {
            if last < first {
                return Err(ValidationError::OutOfOrder {
                    earlier: "first_read",
                    later: "last_read",
                });
            }
        }
        if draft.sequels.contains(&draft.id) {
            return Err(ValidationError::SelfReference("story sequel"));
        }
        if draft.prequels.contains(&draft.id) {
            return Err(ValidationError::SelfReference("story prequel"));
        }

        Ok(Self(draft))
    }

    pub fn edit(&self, f: impl FnOnce(&mut StoryDraft)) -> Result<Self, ValidationError> {
        let mut draft = self.0.clone();
        f(&mut draft);
        Self::new(draft)
    }

    pub fn id(&self) -> StoryId {
        self.0.id
    }

    pub fn author(&self) -> Option<&str> {
        self.0.author.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn url(&self) -> Option<&str> {
        self.0.url.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.0.description.as_deref()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.0.created
    }

    pub fn updated(&self) -> DateTime<Utc> {
        self.0.updated
    }

    pub fn tags(&self) -> &BTreeSet<TagId> {
        &self.0.tags
    }

    pub fn sequels(&self) -> &BTreeSet<StoryId> {
        &self.0.sequels
    }

    pub fn prequels(&self) -> &BTreeSet<StoryId> {
        &self.0.prequels
    }

    pub fn files(&self) -> &BTreeSet<StoryFileId> {
        &self.0.files
    }

    pub fn score(&self) -> Option<Score> {
        self.0.score
    }

    pub fn review(&self) -> Option<&str> {
        self.0.review.as_deref()
    }

    pub fn first_read(&self) -> Option<DateTime<Utc>> {
        self.0.first_read
    }

    pub fn last_read(&self) -> Option<DateTime<Utc>> {
        self.0.last_read
    }

    pub fn times_read(&self) -> u32 {
        self.0.times_read
    }

    pub fn to_draft(&self) -> StoryDraft {
        self.0.clone()
    }

    pub fn into_draft(self) -> StoryDraft {
        self.0
    }
}

impl TryFrom<StoryDraft> for Story {
    type Error = ValidationError;

    fn try_from(draft: StoryDraft) -> Result<Self, Self::Error> {
        Self::new(draft)
    }
}

impl From<Story> for StoryDraft {
    fn from(story: Story) -> Self {
        story.0
    }
}

// ============================================================================
// Story files
// ============================================================================

/// Unvalidated fields of a [`StoryFile`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryFileDraft {
    pub id: StoryFileId,
    pub story_id: StoryId,
    pub format: FileFormat,
    pub file_name: String,
    pub sha256: String,
    pub word_count: u64,
    pub size: u64,
}

/// A source file stored in the archive for a story
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoryFileDraft", into = "StoryFileDraft")]
pub struct StoryFile(StoryFileDraft);

impl StoryFile {
    pub fn new(draft: StoryFileDraft) -> Result<Self, ValidationError> {
        check_name("file name", &draft.file_name, FILE_NAME_MAX)?;
        if draft.file_name.contains(['/', '\\']) || draft.file_name == "." || draft.file_name == ".." {
            return Err(ValidationError::Invalid {
                field: "file name",
                reason: format!("'{}' is not a plain file name", draft.file_name),
            });
        }
        if draft.sha256.len() != 64 || !draft.sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ValidationError::Invalid {
                field: "sha256",
                reason: "expected 64 hexadecimal digits".to_string(),
            });
        }
        Ok(Self(draft))
    }

    pub fn id(&self) -> StoryFileId {
        self.0.id
    }

    pub fn story_id(&self) -> StoryId {
        self.0.story_id
    }

    pub fn format(&self) -> FileFormat {
        self.0.format
    }

    pub fn file_name(&self) -> &str {
        &self.0.file_name
    }

    pub fn sha256(&self) -> &str {
        &self.0.sha256
    }

    pub fn word_count(&self) -> u64 {
        self.0.word_count
    }

    pub fn size(&self) -> u64 {
        self.0.size
    }
}

impl TryFrom<StoryFileDraft> for StoryFile {
    type Error = ValidationError;

    fn try_from(draft: StoryFileDraft) -> Result<Self, Self::Error> {
        Self::new(draft)
    }
}

impl From<StoryFile> for StoryFileDraft {
    fn from(file: StoryFile) -> Self {
        file.0
    }
}
