//! SQLite catalog backend
//!
//! Stores the catalog in normalized tables inside the archive's
//! `catalog.db`. Story aggregates are hydrated with one `IN (...)` query per
//! association, so listing n stories costs a constant number of statements.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Params, Row, Statement, ToSql,
    Transaction,
};

use crate::error::{CatalogError, Result};
use crate::models::{
    CategoryDraft, CategoryId, Color, FileFormat, Score, Story, StoryDraft, StoryFile,
    StoryFileDraft, StoryFileId, StoryId, Tag, TagCategory, TagDraft, TagId,
};

use super::traits::{BackendType, CatalogBackend, CatalogStats, StoryRepository, TagRepository};

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

/// Upper bound on ids bound into one `IN (...)` list
const ID_BATCH: usize = 500;

/// Placeholder replaced by the `?, ?, ...` list of a batched query
const IDS: &str = "{ids}";

const CATEGORY_SELECT: &str =
    "SELECT id, name, description, sort_order, color FROM tag_categories";

const TAG_SELECT: &str = "SELECT t.id, t.name, t.category_id, t.description FROM tags t";

const STORY_SELECT: &str = "SELECT id, author, name, url, description, created, updated, \
     score, review, first_read, last_read, times_read FROM stories";

const FILE_SELECT: &str =
    "SELECT id, story_id, format, file_name, sha256, word_count, size FROM story_files";

macro_rules! sql_id {
    ($($id:ty),+ $(,)?) => {
        $(
            impl ToSql for $id {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.to_string()))
                }
            }

            impl FromSql for $id {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    value
                        .as_str()?
                        .parse()
                        .map_err(|e| FromSqlError::Other(Box::new(e)))
                }
            }
        )+
    };
}

sql_id!(CategoryId, TagId, StoryId, StoryFileId);

impl ToSql for Color {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.packed())))
    }
}

impl FromSql for Color {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let packed = u32::column_result(value)?;
        Color::new(packed).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for FileFormat {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for FileFormat {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        FileFormat::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

/// Fixed-width RFC 3339 so text order matches time order
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(idx, &text)
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_timestamp(idx, &t)).transpose()
}

fn unsigned_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn signed(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| CatalogError::Storage(format!("{} {} does not fit in the database", field, value)))
}

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<CategoryDraft> {
    Ok(CategoryDraft {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        sort_order: row.get(3)?,
        color: row.get(4)?,
    })
}

fn tag_from_row(row: &Row<'_>) -> rusqlite::Result<TagDraft> {
    Ok(TagDraft {
        id: row.get(0)?,
        name: row.get(1)?,
        category_id: row.get(2)?,
        description: row.get(3)?,
        implied_tags: BTreeSet::new(),
    })
}

fn story_from_row(row: &Row<'_>) -> rusqlite::Result<StoryDraft> {
    let score = row
        .get::<_, Option<f64>>(7)?
        .map(|v| {
            Score::new(v).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(7, Type::Real, Box::new(e))
            })
        })
        .transpose()?;

    Ok(StoryDraft {
        id: row.get(0)?,
        author: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        description: row.get(4)?,
        created: timestamp_column(row, 5)?,
        updated: timestamp_column(row, 6)?,
        tags: BTreeSet::new(),
        sequels: BTreeSet::new(),
        prequels: BTreeSet::new(),
        files: BTreeSet::new(),
        score,
        review: row.get(8)?,
        first_read: optional_timestamp_column(row, 9)?,
        last_read: optional_timestamp_column(row, 10)?,
        times_read: row.get(11)?,
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<StoryFileDraft> {
    Ok(StoryFileDraft {
        id: row.get(0)?,
        story_id: row.get(1)?,
        format: row.get(2)?,
        file_name: row.get(3)?,
        sha256: row.get(4)?,
        word_count: unsigned_column(row, 5)?,
        size: unsigned_column(row, 6)?,
    })
}

/// SQLite backend implementation
pub struct SqliteBackend {
    path: PathBuf,
    conn: Mutex<Connection>,
    queries: AtomicUsize,
}

impl SqliteBackend {
    /// Opens (and initializes if empty) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;

        // WAL lets readers in other processes proceed during a write
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let backend = Self {
            path,
            conn: Mutex::new(conn),
            queries: AtomicUsize::new(0),
        };

        backend.init_schema()?;
        log::debug!("opened SQLite catalog at {:?}", backend.path);
        Ok(backend)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        let initialized: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
            [],
            |row| row.get(0),
        )?;
        if !initialized {
            conn.execute_batch(include_str!("schema.sql"))?;
            return Ok(());
        }

        let current_version: i32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| CatalogError::Storage("schema_version table is empty".to_string()))?;

        if current_version != SCHEMA_VERSION {
            return Err(CatalogError::Storage(format!(
                "database schema version {} is not supported, expected {}",
                current_version, SCHEMA_VERSION
            )));
        }

        Ok(())
    }

    /// Number of statements prepared since open or the last reset
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn reset_query_count(&self) {
        self.queries.store(0, Ordering::Relaxed);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CatalogError::poisoned("database connection"))
    }

    /// Runs `f` inside one transaction, committing only on success
    fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // =========================================================================
    // Statement helpers (every prepared statement is counted)
    // =========================================================================

    fn prepare<'c>(&self, conn: &'c Connection, sql: &str) -> Result<Statement<'c>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        Ok(conn.prepare(sql)?)
    }

    fn execute<P: Params>(&self, conn: &Connection, sql: &str, params: P) -> Result<usize> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        Ok(conn.execute(sql, params)?)
    }

    fn query_opt<T, P, F>(&self, conn: &Connection, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.queries.fetch_add(1, Ordering::Relaxed);
        Ok(conn.query_row(sql, params, f).optional()?)
    }

    fn exists<P: Params>(&self, conn: &Connection, sql: &str, params: P) -> Result<bool> {
        Ok(self.query_opt(conn, sql, params, |_| Ok(()))?.is_some())
    }

    fn query_all<T, P, F>(&self, conn: &Connection, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.prepare(conn, sql)?;
        let rows = stmt.query_map(params, f)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Runs a two-column query once per chunk of `ids`, grouping the second
    /// column by the first. `sql` must contain `{ids}`.
    fn grouped<K, V>(&self, conn: &Connection, sql: &str, ids: &[K]) -> Result<BTreeMap<K, BTreeSet<V>>>
    where
        K: ToSql + FromSql + Ord,
        V: FromSql + Ord,
    {
        let mut grouped: BTreeMap<K, BTreeSet<V>> = BTreeMap::new();
        for chunk in ids.chunks(ID_BATCH) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let rows = self.query_all(
                conn,
                &sql.replace(IDS, &placeholders),
                params_from_iter(chunk.iter()),
                |row| Ok((row.get::<_, K>(0)?, row.get::<_, V>(1)?)),
            )?;
            for (key, value) in rows {
                grouped.entry(key).or_default().insert(value);
            }
        }
        Ok(grouped)
    }

    /// Runs a one-column query once per chunk of `ids`. `sql` must contain `{ids}`.
    fn collect_ids<K>(&self, conn: &Connection, sql: &str, ids: &[K]) -> Result<BTreeSet<K>>
    where
        K: ToSql + FromSql + Ord,
    {
        let mut found = BTreeSet::new();
        for chunk in ids.chunks(ID_BATCH) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let rows = self.query_all(
                conn,
                &sql.replace(IDS, &placeholders),
                params_from_iter(chunk.iter()),
                |row| row.get::<_, K>(0),
            )?;
            found.extend(rows);
        }
        Ok(found)
    }

    // =========================================================================
    // Loading
    // =========================================================================

    fn load_categories<P: Params>(&self, conn: &Connection, sql: &str, params: P) -> Result<Vec<TagCategory>> {
        self.query_all(conn, sql, params, category_from_row)?
            .into_iter()
            .map(|draft| Ok(TagCategory::new(draft)?))
            .collect()
    }

    /// Loads tag rows selected by `sql`, then their implications in batches
    fn load_tags<P: Params>(&self, conn: &Connection, sql: &str, params: P) -> Result<Vec<Tag>> {
        let drafts = self.query_all(conn, sql, params, tag_from_row)?;
        let ids: Vec<TagId> = drafts.iter().map(|d| d.id).collect();
        let mut implied = self.grouped::<TagId, TagId>(
            conn,
            "SELECT tag_id, implied_tag_id FROM tag_implications WHERE tag_id IN ({ids})",
            &ids,
        )?;

        drafts
            .into_iter()
            .map(|mut draft| {
                draft.implied_tags = implied.remove(&draft.id).unwrap_or_default();
                Ok(Tag::new(draft)?)
            })
            .collect()
    }

    /// Attaches tags, sequels, prequels and files with one query per
    /// association for the whole batch
    fn hydrate(&self, conn: &Connection, drafts: Vec<StoryDraft>) -> Result<Vec<Story>> {
        let ids: Vec<StoryId> = drafts.iter().map(|d| d.id).collect();

        let mut tags = self.grouped::<StoryId, TagId>(
            conn,
            "SELECT story_id, tag_id FROM story_tags WHERE story_id IN ({ids})",
            &ids,
        )?;
        let mut sequels = self.grouped::<StoryId, StoryId>(
            conn,
            "SELECT story_id, sequel_id FROM story_sequels WHERE story_id IN ({ids})",
            &ids,
        )?;
        let mut prequels = self.grouped::<StoryId, StoryId>(
            conn,
            "SELECT sequel_id, story_id FROM story_sequels WHERE sequel_id IN ({ids})",
            &ids,
        )?;
        let mut files = self.grouped::<StoryId, StoryFileId>(
            conn,
            "SELECT story_id, id FROM story_files WHERE story_id IN ({ids})",
            &ids,
        )?;

        drafts
            .into_iter()
            .map(|mut draft| {
                draft.tags = tags.remove(&draft.id).unwrap_or_default();
                draft.sequels = sequels.remove(&draft.id).unwrap_or_default();
                draft.prequels = prequels.remove(&draft.id).unwrap_or_default();
                draft.files = files.remove(&draft.id).unwrap_or_default();
                Ok(Story::new(draft)?)
            })
            .collect()
    }

    fn load_files<P: Params>(&self, conn: &Connection, sql: &str, params: P) -> Result<Vec<StoryFile>> {
        self.query_all(conn, sql, params, file_from_row)?
            .into_iter()
            .map(|draft| Ok(StoryFile::new(draft)?))
            .collect()
    }

    // =========================================================================
    // Write checks
    // =========================================================================

    fn category_exists(&self, conn: &Connection, id: CategoryId) -> Result<bool> {
        self.exists(conn, "SELECT 1 FROM tag_categories WHERE id = ?1", params![id])
    }

    fn tag_exists(&self, conn: &Connection, id: TagId) -> Result<bool> {
        self.exists(conn, "SELECT 1 FROM tags WHERE id = ?1", params![id])
    }

    fn story_exists(&self, conn: &Connection, id: StoryId) -> Result<bool> {
        self.exists(conn, "SELECT 1 FROM stories WHERE id = ?1", params![id])
    }

    fn check_category_name(&self, conn: &Connection, category: &TagCategory) -> Result<()> {
        let clash = self.exists(
            conn,
            "SELECT 1 FROM tag_categories WHERE name = ?1 AND id <> ?2",
            params![category.name(), category.id()],
        )?;
        if clash {
            return Err(CatalogError::conflict("category name", category.name()));
        }
        Ok(())
    }

    fn check_tag(&self, conn: &Connection, tag: &Tag) -> Result<()> {
        if !self.category_exists(conn, tag.category_id())? {
            return Err(CatalogError::missing("tag category", tag.category_id()));
        }

        let implied: Vec<TagId> = tag.implied_tags().iter().copied().collect();
        let found = self.collect_ids(conn, "SELECT id FROM tags WHERE id IN ({ids})", &implied)?;
        if let Some(missing) = implied.iter().find(|id| !found.contains(id)) {
            return Err(CatalogError::missing("tag", missing));
        }

        let clash = self.exists(
            conn,
            "SELECT 1 FROM tags WHERE name = ?1 AND id <> ?2",
            params![tag.name(), tag.id()],
        )?;
        if clash {
            return Err(CatalogError::conflict("tag name", tag.name()));
        }
        Ok(())
    }

    fn insert_implications(&self, conn: &Connection, tag: &Tag) -> Result<()> {
        if tag.implied_tags().is_empty() {
            return Ok(());
        }
        let mut stmt = self.prepare(
            conn,
            "INSERT INTO tag_implications (tag_id, implied_tag_id) VALUES (?1, ?2)",
        )?;
        for implied in tag.implied_tags() {
            stmt.execute(params![tag.id(), implied])?;
        }
        Ok(())
    }

    /// Newly attached tags and every linked story must exist. Tags the story
    /// already carried may dangle.
    fn check_story_links(&self, conn: &Connection, story: &Story) -> Result<()> {
        let current: BTreeSet<TagId> = self
            .query_all(
                conn,
                "SELECT tag_id FROM story_tags WHERE story_id = ?1",
                params![story.id()],
                |row| row.get(0),
            )?
            .into_iter()
            .collect();
        let added: Vec<TagId> = story.tags().difference(&current).copied().collect();
        let found = self.collect_ids(conn, "SELECT id FROM tags WHERE id IN ({ids})", &added)?;
        if let Some(missing) = added.iter().find(|id| !found.contains(id)) {
            return Err(CatalogError::missing("tag", missing));
        }

        let linked: Vec<StoryId> = story.sequels().union(story.prequels()).copied().collect();
        let found = self.collect_ids(conn, "SELECT id FROM stories WHERE id IN ({ids})", &linked)?;
        if let Some(missing) = linked.iter().find(|id| !found.contains(id)) {
            return Err(CatalogError::missing("story", missing));
        }
        Ok(())
    }

    /// Replaces the story's tag rows and every link touching it
    fn write_story_links(&self, conn: &Connection, story: &Story) -> Result<()> {
        let id = story.id();
        self.execute(conn, "DELETE FROM story_tags WHERE story_id = ?1", params![id])?;
        self.execute(
            conn,
            "DELETE FROM story_sequels WHERE story_id = ?1 OR sequel_id = ?1",
            params![id],
        )?;

        if !story.tags().is_empty() {
            let mut stmt = self.prepare(
                conn,
                "INSERT INTO story_tags (story_id, tag_id) VALUES (?1, ?2)",
            )?;
            for tag in story.tags() {
                stmt.execute(params![id, tag])?;
            }
        }

        if !story.sequels().is_empty() || !story.prequels().is_empty() {
            let mut stmt = self.prepare(
                conn,
                "INSERT OR IGNORE INTO story_sequels (story_id, sequel_id) VALUES (?1, ?2)",
            )?;
            for sequel in story.sequels() {
                stmt.execute(params![id, sequel])?;
            }
            for prequel in story.prequels() {
                stmt.execute(params![prequel, id])?;
            }
        }
        Ok(())
    }
}

impl TagRepository for SqliteBackend {
    fn get_category(&self, id: CategoryId) -> Result<Option<TagCategory>> {
        let conn = self.lock()?;
        let sql = format!("{} WHERE id = ?1", CATEGORY_SELECT);
        Ok(self.load_categories(&conn, &sql, params![id])?.into_iter().next())
    }

    fn get_category_by_name(&self, name: &str) -> Result<Option<TagCategory>> {
        let conn = self.lock()?;
        let sql = format!("{} WHERE name = ?1", CATEGORY_SELECT);
        Ok(self.load_categories(&conn, &sql, params![name])?.into_iter().next())
    }

    fn list_categories(&self) -> Result<Vec<TagCategory>> {
        let conn = self.lock()?;
        let sql = format!("{} ORDER BY sort_order, name", CATEGORY_SELECT);
        self.load_categories(&conn, &sql, [])
    }

    fn create_category(&self, category: &TagCategory) -> Result<()> {
        self.with_tx(|tx| {
            if self.category_exists(tx, category.id())? {
                return Err(CatalogError::conflict("category id", category.id().to_string()));
            }
            self.check_category_name(tx, category)?;
            self.execute(
                tx,
                "INSERT INTO tag_categories (id, name, description, sort_order, color)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    category.id(),
                    category.name(),
                    category.description(),
                    category.sort_order(),
                    category.color(),
                ],
            )?;
            Ok(())
        })
    }

    fn update_category(&self, category: &TagCategory) -> Result<()> {
        self.with_tx(|tx| {
            if !self.category_exists(tx, category.id())? {
                return Ok(());
            }
            self.check_category_name(tx, category)?;
            self.execute(
                tx,
                "UPDATE tag_categories SET name = ?2, description = ?3, sort_order = ?4, color = ?5
                 WHERE id = ?1",
                params![
                    category.id(),
                    category.name(),
                    category.description(),
                    category.sort_order(),
                    category.color(),
                ],
            )?;
            Ok(())
        })
    }

    fn delete_category(&self, id: CategoryId) -> Result<()> {
        self.with_tx(|tx| {
            if !self.category_exists(tx, id)? {
                return Ok(());
            }
            let referencing: i64 = self
                .query_opt(
                    tx,
                    "SELECT COUNT(*) FROM tags WHERE category_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?
                .unwrap_or(0);
            if referencing > 0 {
                return Err(CatalogError::CategoryInUse {
                    id: id.to_string(),
                    tags: referencing as usize,
                });
            }
            self.execute(tx, "DELETE FROM tag_categories WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    fn change_category(&self, from: CategoryId, to: CategoryId) -> Result<usize> {
        self.with_tx(|tx| {
            if !self.category_exists(tx, to)? {
                return Err(CatalogError::missing("tag category", to));
            }
            if from == to {
                return Ok(0);
            }
            self.execute(
                tx,
                "UPDATE tags SET category_id = ?2 WHERE category_id = ?1",
                params![from, to],
            )
        })
    }

    fn get_tag(&self, id: TagId) -> Result<Option<Tag>> {
        self.with_tx(|tx| {
            let sql = format!("{} WHERE t.id = ?1", TAG_SELECT);
            Ok(self.load_tags(tx, &sql, params![id])?.into_iter().next())
        })
    }

    fn get_tag_by_name(&self, name: &str) -> Result<Option<Tag>> {
        self.with_tx(|tx| {
            let sql = format!("{} WHERE t.name = ?1", TAG_SELECT);
            Ok(self.load_tags(tx, &sql, params![name])?.into_iter().next())
        })
    }

    fn list_tags(&self) -> Result<Vec<Tag>> {
        self.with_tx(|tx| {
            let sql = format!("{} ORDER BY t.name", TAG_SELECT);
            self.load_tags(tx, &sql, [])
        })
    }

    fn tags_in_category(&self, category: CategoryId) -> Result<Vec<Tag>> {
        self.with_tx(|tx| {
            let sql = format!("{} WHERE t.category_id = ?1 ORDER BY t.name", TAG_SELECT);
            self.load_tags(tx, &sql, params![category])
        })
    }

    fn tags_in_category_including_implied(&self, category: CategoryId) -> Result<Vec<Tag>> {
        // UNION (not UNION ALL) drops revisited rows, which ends the
        // recursion on implication cycles
        let sql = format!(
            "WITH RECURSIVE included(id) AS (
                 SELECT id FROM tags WHERE category_id = ?1
                 UNION
                 SELECT ti.tag_id FROM tag_implications ti
                 JOIN included ON ti.implied_tag_id = included.id
             )
             {} JOIN included ON included.id = t.id ORDER BY t.name",
            TAG_SELECT
        );
        self.with_tx(|tx| self.load_tags(tx, &sql, params![category]))
    }

    fn implying_tags(&self, tag: TagId) -> Result<Vec<Tag>> {
        let sql = format!(
            "{} JOIN tag_implications ti ON ti.tag_id = t.id
             WHERE ti.implied_tag_id = ?1 ORDER BY t.name",
            TAG_SELECT
        );
        self.with_tx(|tx| self.load_tags(tx, &sql, params![tag]))
    }

    fn create_tag(&self, tag: &Tag) -> Result<()> {
        self.with_tx(|tx| {
            if self.tag_exists(tx, tag.id())? {
                return Err(CatalogError::conflict("tag id", tag.id().to_string()));
            }
            self.check_tag(tx, tag)?;
            self.execute(
                tx,
                "INSERT INTO tags (id, name, category_id, description) VALUES (?1, ?2, ?3, ?4)",
                params![tag.id(), tag.name(), tag.category_id(), tag.description()],
            )?;
            self.insert_implications(tx, tag)
        })
    }

    fn update_tag(&self, tag: &Tag) -> Result<()> {
        self.with_tx(|tx| {
            if !self.tag_exists(tx, tag.id())? {
                return Ok(());
            }
            self.check_tag(tx, tag)?;
            self.execute(
                tx,
                "UPDATE tags SET name = ?2, category_id = ?3, description = ?4 WHERE id = ?1",
                params![tag.id(), tag.name(), tag.category_id(), tag.description()],
            )?;
            self.execute(
                tx,
                "DELETE FROM tag_implications WHERE tag_id = ?1",
                params![tag.id()],
            )?;
            self.insert_implications(tx, tag)
        })
    }

    fn delete_tag(&self, id: TagId) -> Result<()> {
        // implication rows cascade; story_tags rows are kept on purpose
        self.with_tx(|tx| {
            self.execute(tx, "DELETE FROM tags WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    fn existing_tags(&self, ids: &BTreeSet<TagId>) -> Result<BTreeSet<TagId>> {
        let ids: Vec<TagId> = ids.iter().copied().collect();
        self.with_tx(|tx| self.collect_ids(tx, "SELECT id FROM tags WHERE id IN ({ids})", &ids))
    }

    fn resolve_implied(&self, explicit: &BTreeSet<TagId>) -> Result<BTreeSet<TagId>> {
        let ids: Vec<TagId> = explicit.iter().copied().collect();
        self.with_tx(|tx| {
            self.collect_ids(
                tx,
                "WITH RECURSIVE implied(id) AS (
                     SELECT id FROM tags WHERE id IN ({ids})
                     UNION
                     SELECT ti.implied_tag_id FROM tag_implications ti
                     JOIN implied ON ti.tag_id = implied.id
                 )
                 SELECT id FROM implied",
                &ids,
            )
        })
    }
}

impl StoryRepository for SqliteBackend {
    fn list_stories(&self) -> Result<Vec<Story>> {
        self.with_tx(|tx| {
            let sql = format!("{} ORDER BY created, id", STORY_SELECT);
            let drafts = self.query_all(tx, &sql, [], story_from_row)?;
            self.hydrate(tx, drafts)
        })
    }

    fn get_story(&self, id: StoryId) -> Result<Option<Story>> {
        self.with_tx(|tx| {
            let sql = format!("{} WHERE id = ?1", STORY_SELECT);
            let drafts = self.query_all(tx, &sql, params![id], story_from_row)?;
            Ok(self.hydrate(tx, drafts)?.into_iter().next())
        })
    }

    fn create_story(&self, story: &Story) -> Result<()> {
        self.with_tx(|tx| {
            if self.story_exists(tx, story.id())? {
                return Err(CatalogError::conflict("story id", story.id().to_string()));
            }
            self.check_story_links(tx, story)?;
            self.execute(
                tx,
                "INSERT INTO stories
                 (id, author, name, url, description, created, updated, score, review,
                  first_read, last_read, times_read)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    story.id(),
                    story.author(),
                    story.name(),
                    story.url(),
                    story.description(),
                    timestamp(&story.created()),
                    timestamp(&story.updated()),
                    story.score().map(Score::value),
                    story.review(),
                    story.first_read().as_ref().map(timestamp),
                    story.last_read().as_ref().map(timestamp),
                    story.times_read(),
                ],
            )?;
            self.write_story_links(tx, story)
        })
    }

    fn update_story(&self, story: &Story) -> Result<()> {
        self.with_tx(|tx| {
            if !self.story_exists(tx, story.id())? {
                return Ok(());
            }
            self.check_story_links(tx, story)?;
            self.execute(
                tx,
                "UPDATE stories SET author = ?2, name = ?3, url = ?4, description = ?5,
                     created = ?6, updated = ?7, score = ?8, review = ?9,
                     first_read = ?10, last_read = ?11, times_read = ?12
                 WHERE id = ?1",
                params![
                    story.id(),
                    story.author(),
                    story.name(),
                    story.url(),
                    story.description(),
                    timestamp(&story.created()),
                    timestamp(&story.updated()),
                    story.score().map(Score::value),
                    story.review(),
                    story.first_read().as_ref().map(timestamp),
                    story.last_read().as_ref().map(timestamp),
                    story.times_read(),
                ],
            )?;
            self.write_story_links(tx, story)
        })
    }

    fn delete_story(&self, id: StoryId) -> Result<()> {
        // tags, links and file records cascade
        self.with_tx(|tx| {
            self.execute(tx, "DELETE FROM stories WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    fn add_file(&self, file: &StoryFile) -> Result<()> {
        self.with_tx(|tx| {
            if !self.story_exists(tx, file.story_id())? {
                return Err(CatalogError::missing("story", file.story_id()));
            }
            if self.exists(tx, "SELECT 1 FROM story_files WHERE id = ?1", params![file.id()])? {
                return Err(CatalogError::conflict("file id", file.id().to_string()));
            }
            if self.exists(
                tx,
                "SELECT 1 FROM story_files WHERE file_name = ?1",
                params![file.file_name()],
            )? {
                return Err(CatalogError::conflict("file name", file.file_name()));
            }
            self.execute(
                tx,
                "INSERT INTO story_files (id, story_id, format, file_name, sha256, word_count, size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    file.id(),
                    file.story_id(),
                    file.format(),
                    file.file_name(),
                    file.sha256(),
                    signed(file.word_count(), "word count")?,
                    signed(file.size(), "file size")?,
                ],
            )?;
            Ok(())
        })
    }

    fn get_file(&self, id: StoryFileId) -> Result<Option<StoryFile>> {
        let conn = self.lock()?;
        let sql = format!("{} WHERE id = ?1", FILE_SELECT);
        Ok(self.load_files(&conn, &sql, params![id])?.into_iter().next())
    }

    fn get_file_by_name(&self, file_name: &str) -> Result<Option<StoryFile>> {
        let conn = self.lock()?;
        let sql = format!("{} WHERE file_name = ?1", FILE_SELECT);
        Ok(self.load_files(&conn, &sql, params![file_name])?.into_iter().next())
    }

    fn files_for_story(&self, story: StoryId) -> Result<Vec<StoryFile>> {
        let conn = self.lock()?;
        let sql = format!("{} WHERE story_id = ?1 ORDER BY file_name", FILE_SELECT);
        self.load_files(&conn, &sql, params![story])
    }

    fn list_files(&self) -> Result<Vec<StoryFile>> {
        let conn = self.lock()?;
        let sql = format!("{} ORDER BY file_name", FILE_SELECT);
        self.load_files(&conn, &sql, [])
    }

    fn delete_file(&self, id: StoryFileId) -> Result<()> {
        let conn = self.lock()?;
        self.execute(&conn, "DELETE FROM story_files WHERE id = ?1", params![id])?;
        Ok(())
    }
}

impl CatalogBackend for SqliteBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Sqlite
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn stats(&self) -> Result<CatalogStats> {
        self.with_tx(|tx| {
            let count = |table: &str| -> Result<usize> {
                let sql = format!("SELECT COUNT(*) FROM {}", table);
                let n: i64 = self.query_opt(tx, &sql, [], |row| row.get(0))?.unwrap_or(0);
                Ok(n as usize)
            };
            Ok(CatalogStats {
                category_count: count("tag_categories")?,
                tag_count: count("tags")?,
                story_count: count("stories")?,
                backend_type: BackendType::Sqlite,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::conformance::backend_conformance;
    use crate::models::StoryDraft;
    use tempfile::TempDir;

    fn open_backend(root: &Path) -> SqliteBackend {
        SqliteBackend::new(root.join("catalog.db")).unwrap()
    }

    backend_conformance!(open_backend);

    fn seed_tags(backend: &SqliteBackend, count: usize) -> Vec<TagId> {
        let category = TagCategory::new(CategoryDraft::new("Genre")).unwrap();
        backend.create_category(&category).unwrap();
        (0..count)
            .map(|i| {
                let tag = Tag::new(TagDraft::new(format!("Tag {}", i), category.id())).unwrap();
                backend.create_tag(&tag).unwrap();
                tag.id()
            })
            .collect()
    }

    #[test]
    fn test_hydration_uses_constant_query_count() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(dir.path());
        let tags = seed_tags(&backend, 3);

        for i in 0..100 {
            let mut draft = StoryDraft::new(format!("Story {}", i));
            draft.tags = tags.iter().copied().collect();
            backend.create_story(&Story::new(draft).unwrap()).unwrap();
        }

        backend.reset_query_count();
        let stories = backend.list_stories().unwrap();
        assert_eq!(stories.len(), 100);
        assert!(stories.iter().all(|s| s.tags().len() == 3));
        // one story query plus one per association
        assert!(backend.query_count() <= 5, "issued {} queries", backend.query_count());
    }

    #[test]
    fn test_hydration_splits_large_story_batches() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(dir.path());
        let tags = seed_tags(&backend, 2);

        let mut ids = Vec::new();
        for i in 0..ID_BATCH + 20 {
            let mut draft = StoryDraft::new(format!("Story {}", i));
            draft.tags = BTreeSet::from([tags[i % 2]]);
            if i == ID_BATCH + 10 {
                draft.sequels = BTreeSet::from([ids[0]]);
            }
            let story = Story::new(draft).unwrap();
            backend.create_story(&story).unwrap();
            ids.push(story.id());
        }

        backend.reset_query_count();
        let stories = backend.list_stories().unwrap();
        assert_eq!(stories.len(), ID_BATCH + 20);
        assert!(stories.iter().all(|s| s.tags().len() == 1));
        // one story query plus two chunks per association
        assert!(backend.query_count() <= 9, "issued {} queries", backend.query_count());

        let by_id: BTreeMap<StoryId, &Story> = stories.iter().map(|s| (s.id(), s)).collect();
        assert_eq!(
            by_id[&ids[ID_BATCH + 10]].sequels(),
            &BTreeSet::from([ids[0]])
        );
        assert_eq!(
            by_id[&ids[0]].prequels(),
            &BTreeSet::from([ids[ID_BATCH + 10]])
        );
    }

    #[test]
    fn test_large_batches_are_chunked() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(dir.path());
        let tags: BTreeSet<TagId> = seed_tags(&backend, ID_BATCH + 20).into_iter().collect();

        assert_eq!(backend.existing_tags(&tags).unwrap(), tags);
        let listed = backend.list_tags().unwrap();
        assert_eq!(listed.len(), ID_BATCH + 20);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let category = TagCategory::new(CategoryDraft::new("Fandom")).unwrap();
        {
            let backend = open_backend(dir.path());
            backend.create_category(&category).unwrap();
        }

        let backend = open_backend(dir.path());
        assert_eq!(backend.get_category(category.id()).unwrap(), Some(category));
        assert_eq!(backend.stats().unwrap().category_count, 1);
    }

    #[test]
    fn test_unsupported_schema_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_version (version INTEGER NOT NULL);
                 INSERT INTO schema_version (version) VALUES (7);",
            )
            .unwrap();
        }

        assert!(matches!(
            SqliteBackend::new(&path),
            Err(CatalogError::Storage(_))
        ));
    }

    #[test]
    fn test_unreadable_schema_version_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_version (version TEXT NOT NULL);
                 INSERT INTO schema_version (version) VALUES ('one');
                 CREATE TABLE stories (id TEXT PRIMARY KEY);",
            )
            .unwrap();
        }

        assert!(matches!(
            SqliteBackend::new(&path),
            Err(CatalogError::Database(_))
        ));

        let empty = dir.path().join("empty.db");
        Connection::open(&empty)
            .unwrap()
            .execute_batch("CREATE TABLE schema_version (version INTEGER NOT NULL);")
            .unwrap();
        assert!(matches!(
            SqliteBackend::new(&empty),
            Err(CatalogError::Storage(_))
        ));
    }
}
