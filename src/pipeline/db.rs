//! Durable store: traits consumed by the pipeline plus the SQLite implementation
//!
//! Tables (see `/sql/` directory):
//! - `content_records` - INSERT per materialized post, UPDATE on approval
//! - `engagement_records` - INSERT (append-only, windowed per subject/actor)
//! - `likes` - INSERT / DELETE, UNIQUE(subject_id, actor_id)
//! - `comments` - INSERT (append-only, threaded via parent_id)

use super::types::{
    Comment, ContentRecord, EngagementRecord, NewContentRecord, SubjectStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::sqlite_pragma::apply_optimized_pragmas;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connectivity/contention failure; worth retrying
    Database(String),
    /// A concurrent writer got there first (duplicate like, view inside window)
    Conflict(String),
    NotFound(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Conflict(e) => write!(f, "Conflict: {}", e),
            StoreError::NotFound(e) => write!(f, "Not found: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Content records: creation by the materializer, moderation by operators
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Insert one post, unapproved, stamped with the store's clock
    async fn create_content_record(&self, record: NewContentRecord) -> Result<i64, StoreError>;

    async fn get_content_record(&self, id: i64) -> Result<Option<ContentRecord>, StoreError>;

    /// Posts with the given approval state, newest first
    async fn list_content(&self, approved: bool) -> Result<Vec<ContentRecord>, StoreError>;

    async fn approve_content(&self, id: i64) -> Result<(), StoreError>;

    async fn delete_content(&self, id: i64) -> Result<(), StoreError>;

    async fn count_content(&self) -> Result<i64, StoreError>;
}

/// Views, likes and comments keyed by (subject, actor)
#[async_trait]
pub trait EngagementStore: Send + Sync {
    /// Most recent view of `subject_id` by `actor_id`
    async fn get_last_engagement(
        &self,
        subject_id: i64,
        actor_id: i64,
    ) -> Result<Option<EngagementRecord>, StoreError>;

    /// Insert a view at `occurred_at`
    ///
    /// The window check is repeated inside a write transaction: if another
    /// view for the same pair is closer than `min_interval`, nothing is
    /// written and `StoreError::Conflict` is returned.
    async fn create_engagement_record(
        &self,
        subject_id: i64,
        actor_id: i64,
        occurred_at: DateTime<Utc>,
        min_interval: chrono::Duration,
    ) -> Result<i64, StoreError>;

    /// Number of stored view records for a subject
    async fn count_viewers(&self, subject_id: i64) -> Result<i64, StoreError>;

    /// Number of different actors that have ever viewed a subject
    async fn count_distinct_actors(&self, subject_id: i64) -> Result<i64, StoreError>;

    /// Returns the new like count; `Conflict` if the actor already liked it
    async fn add_like(&self, subject_id: i64, actor_id: i64) -> Result<i64, StoreError>;

    /// Returns the new like count; `NotFound` if there was no like
    async fn remove_like(&self, subject_id: i64, actor_id: i64) -> Result<i64, StoreError>;

    async fn add_comment(
        &self,
        subject_id: i64,
        actor_id: i64,
        text: &str,
        parent_id: Option<i64>,
    ) -> Result<Comment, StoreError>;

    /// Comments on a subject in creation order
    async fn list_comments(&self, subject_id: i64) -> Result<Vec<Comment>, StoreError>;

    async fn subject_stats(
        &self,
        subject_id: i64,
        viewer_id: Option<i64>,
    ) -> Result<SubjectStats, StoreError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir`, sorted by file name, and executes
/// them. All SQL files must use "IF NOT EXISTS" clauses for idempotency.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::NotFound(format!(
            "Schema directory not found: {}",
            schema_dir
        )));
    }

    apply_optimized_pragmas(conn)?;

    // Alphabetical order gives 01_, 02_, ... sequencing
    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().to_string();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

const CONTENT_COLUMNS: &str = "id, group_key, author_channel, source_message_id, title, text, \
                               media_urls, approved, created_at";

fn content_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContentRecord> {
    let media_json: String = row.get(6)?;
    let media_urls: Vec<String> = serde_json::from_str(&media_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ContentRecord {
        id: row.get(0)?,
        group_key: row.get(1)?,
        author_channel: row.get(2)?,
        source_message_id: row.get(3)?,
        title: row.get(4)?,
        text: row.get(5)?,
        media_urls,
        approved: row.get(7)?,
        created_at: from_millis(row.get(8)?),
    })
}

fn comment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        actor_id: row.get(2)?,
        parent_id: row.get(3)?,
        text: row.get(4)?,
        created_at: from_millis(row.get(5)?),
    })
}

/// SQLite implementation of `ContentStore` and `EngagementStore`
///
/// A single connection behind a mutex: every operation is short and
/// synchronous, and SQLite serializes writers anyway.
///
/// The lock is store-wide, so engagement writes for different
/// (subject, actor) pairs are serialized too, not only repeats of one pair.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`
    ///
    /// Does NOT create the schema; run `run_schema_migrations` first or use
    /// `open_with_schema`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_with_schema(
        db_path: impl AsRef<Path>,
        schema_dir: &str,
    ) -> Result<Self, StoreError> {
        let store = Self::open(db_path)?;
        {
            let mut conn = store.conn();
            run_schema_migrations(&mut conn, schema_dir)?;
        }
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves SQLite itself consistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subject_exists(conn: &Connection, subject_id: i64) -> Result<bool, StoreError> {
        let mut stmt = conn.prepare_cached("SELECT 1 FROM content_records WHERE id = ?1")?;
        Ok(stmt.exists([subject_id])?)
    }

    fn count_likes(conn: &Connection, subject_id: i64) -> Result<i64, StoreError> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM likes WHERE subject_id = ?1",
            [subject_id],
            |row| row.get(0),
        )?)
    }
}

#[async_trait]
impl ContentStore for SqliteStore {
    async fn create_content_record(&self, record: NewContentRecord) -> Result<i64, StoreError> {
        let media_json = serde_json::to_string(&record.media_urls)
            .map_err(|e| StoreError::Database(format!("media_urls encoding: {}", e)))?;

        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO content_records (
                group_key, author_channel, source_message_id, title, text,
                media_urls, approved, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
            "#,
            params![
                record.group_key,
                record.author_channel,
                record.source_message_id,
                record.title,
                record.text,
                media_json,
                to_millis(Utc::now()),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    async fn get_content_record(&self, id: i64) -> Result<Option<ContentRecord>, StoreError> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM content_records WHERE id = ?1", CONTENT_COLUMNS);
        Ok(conn.query_row(&sql, [id], content_from_row).optional()?)
    }

    async fn list_content(&self, approved: bool) -> Result<Vec<ContentRecord>, StoreError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM content_records WHERE approved = ?1 ORDER BY created_at DESC, id DESC",
            CONTENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([approved], content_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn approve_content(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        let updated = conn.execute("UPDATE content_records SET approved = 1 WHERE id = ?1", [id])?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("content record {}", id)));
        }
        Ok(())
    }

    async fn delete_content(&self, id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM content_records WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("content record {}", id)));
        }
        tx.execute("DELETE FROM likes WHERE subject_id = ?1", [id])?;
        tx.execute("DELETE FROM comments WHERE subject_id = ?1", [id])?;
        tx.execute("DELETE FROM engagement_records WHERE subject_id = ?1", [id])?;
        tx.commit()?;
        Ok(())
    }

    async fn count_content(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM content_records", [], |row| row.get(0))?)
    }
}

#[async_trait]
impl EngagementStore for SqliteStore {
    async fn get_last_engagement(
        &self,
        subject_id: i64,
        actor_id: i64,
    ) -> Result<Option<EngagementRecord>, StoreError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                r#"
                SELECT id, subject_id, actor_id, occurred_at FROM engagement_records
                WHERE subject_id = ?1 AND actor_id = ?2
                ORDER BY occurred_at DESC, id DESC
                LIMIT 1
                "#,
                [subject_id, actor_id],
                |row| {
                    Ok(EngagementRecord {
                        id: row.get(0)?,
                        subject_id: row.get(1)?,
                        actor_id: row.get(2)?,
                        occurred_at: from_millis(row.get(3)?),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    async fn create_engagement_record(
        &self,
        subject_id: i64,
        actor_id: i64,
        occurred_at: DateTime<Utc>,
        min_interval: chrono::Duration,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        // IMMEDIATE takes the write lock up front so the read below cannot go stale
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last: Option<i64> = tx
            .query_row(
                r#"
                SELECT occurred_at FROM engagement_records
                WHERE subject_id = ?1 AND actor_id = ?2
                ORDER BY occurred_at DESC
                LIMIT 1
                "#,
                [subject_id, actor_id],
                |row| row.get(0),
            )
            .optional()?;

        let occurred_ms = to_millis(occurred_at);
        if let Some(last_ms) = last {
            // Same boundary as `EngagementDeduplicator::record_view`: a gap of
            // exactly `min_interval` is allowed (see DESIGN.md)
            if occurred_ms - last_ms < min_interval.num_milliseconds() {
                return Err(StoreError::Conflict(format!(
                    "view of {} by {} already recorded {}ms earlier",
                    subject_id,
                    actor_id,
                    occurred_ms - last_ms
                )));
            }
        }

        tx.execute(
            "INSERT INTO engagement_records (subject_id, actor_id, occurred_at) VALUES (?1, ?2, ?3)",
            params![subject_id, actor_id, occurred_ms],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(id)
    }

    async fn count_viewers(&self, subject_id: i64) -> Result<i64, StoreError> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM engagement_records WHERE subject_id = ?1",
            [subject_id],
            |row| row.get(0),
        )?)
    }

    async fn count_distinct_actors(&self, subject_id: i64) -> Result<i64, StoreError> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(DISTINCT actor_id) FROM engagement_records WHERE subject_id = ?1",
            [subject_id],
            |row| row.get(0),
        )?)
    }

    async fn add_like(&self, subject_id: i64, actor_id: i64) -> Result<i64, StoreError> {
        let conn = self.conn();
        if !Self::subject_exists(&conn, subject_id)? {
            return Err(StoreError::NotFound(format!("content record {}", subject_id)));
        }

        match conn.execute(
            "INSERT INTO likes (subject_id, actor_id, created_at) VALUES (?1, ?2, ?3)",
            params![subject_id, actor_id, to_millis(Utc::now())],
        ) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::Conflict(format!(
                    "{} already liked {}",
                    actor_id, subject_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        Self::count_likes(&conn, subject_id)
    }

    async fn remove_like(&self, subject_id: i64, actor_id: i64) -> Result<i64, StoreError> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM likes WHERE subject_id = ?1 AND actor_id = ?2",
            [subject_id, actor_id],
        )?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!(
                "like of {} by {}",
                subject_id, actor_id
            )));
        }

        Self::count_likes(&conn, subject_id)
    }

    async fn add_comment(
        &self,
        subject_id: i64,
        actor_id: i64,
        text: &str,
        parent_id: Option<i64>,
    ) -> Result<Comment, StoreError> {
        let conn = self.conn();
        if !Self::subject_exists(&conn, subject_id)? {
            return Err(StoreError::NotFound(format!("content record {}", subject_id)));
        }

        // Parents must already exist on the same subject, which also rules out cycles
        let parent_id = match parent_id {
            Some(pid) => {
                let parent_subject: Option<i64> = conn
                    .query_row(
                        "SELECT subject_id FROM comments WHERE id = ?1",
                        [pid],
                        |row| row.get(0),
                    )
                    .optional()?;
                if parent_subject == Some(subject_id) {
                    Some(pid)
                } else {
                    log::warn!(
                        "⚠️  Comment parent {} not found on subject {}, storing as top-level",
                        pid,
                        subject_id
                    );
                    None
                }
            }
            None => None,
        };

        let created_at = Utc::now();
        conn.execute(
            r#"
            INSERT INTO comments (subject_id, actor_id, parent_id, text, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![subject_id, actor_id, parent_id, text, to_millis(created_at)],
        )?;

        Ok(Comment {
            id: conn.last_insert_rowid(),
            subject_id,
            actor_id,
            parent_id,
            text: text.to_string(),
            created_at: from_millis(to_millis(created_at)),
        })
    }

    async fn list_comments(&self, subject_id: i64) -> Result<Vec<Comment>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, subject_id, actor_id, parent_id, text, created_at FROM comments
            WHERE subject_id = ?1
            ORDER BY created_at ASC, id ASC
            "#,
        )?;
        let comments = stmt
            .query_map([subject_id], comment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(comments)
    }

    async fn subject_stats(
        &self,
        subject_id: i64,
        viewer_id: Option<i64>,
    ) -> Result<SubjectStats, StoreError> {
        let conn = self.conn();

        let likes_count = Self::count_likes(&conn, subject_id)?;
        let comment_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM comments WHERE subject_id = ?1",
            [subject_id],
            |row| row.get(0),
        )?;
        let viewers_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM engagement_records WHERE subject_id = ?1",
            [subject_id],
            |row| row.get(0),
        )?;
        let is_liked_by_viewer = match viewer_id {
            Some(actor_id) => conn
                .prepare_cached("SELECT 1 FROM likes WHERE subject_id = ?1 AND actor_id = ?2")?
                .exists([subject_id, actor_id])?,
            None => false,
        };

        Ok(SubjectStats {
            likes_count,
            comment_count,
            viewers_count,
            is_liked_by_viewer,
        })
    }
}
