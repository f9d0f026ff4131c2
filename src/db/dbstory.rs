use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Error as SqlxError, Row};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::models::{PersistenceError, StoryId, UserId};
use crate::services::persistence::{BlockRecord, PersistenceGateway};

/// Database connection pool backing the session layer's persistence gateway.
///
/// Block ids travel as text on the wire; the tables key blocks by integer,
/// so every lookup compares on `id::text`.
pub struct DbStory {
    pool: PgPool,
}

impl DbStory {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn new(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2) // Keep some connections alive
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // Close idle connections after 10 minutes
            .max_lifetime(Duration::from_secs(1800)) // Recycle connections after 30 minutes
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    fn log_pool(&self, op: &str) {
        let pool_idle = self.pool.num_idle() as u32;
        let pool_size = self.pool.size();
        debug!(
            "{}: pool connections {} idle, {} in use",
            op,
            pool_idle,
            pool_size.saturating_sub(pool_idle)
        );
    }
}

#[async_trait]
impl PersistenceGateway for DbStory {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn load_block(&self, block_id: &str) -> Result<Option<BlockRecord>, PersistenceError> {
        self.log_pool("load_block");

        let row = sqlx::query(
            r#"
            SELECT id::text AS id, story_id::bigint AS story_id, content,
                   locked_by::bigint AS locked_by, locked_at,
                   last_edited_by::bigint AS last_edited_by, last_edited_at
            FROM story_blocks
            WHERE id::text = $1
            "#,
        )
        .bind(block_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(BlockRecord {
            id: row.try_get("id")?,
            story_id: row.try_get("story_id")?,
            content: row.try_get::<Option<String>, _>("content")?.unwrap_or_default(),
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            last_edited_by: row.try_get("last_edited_by")?,
            last_edited_at: row.try_get("last_edited_at")?,
        }))
    }

    async fn save_block_version(
        &self,
        block_id: &str,
        content: &str,
        editor: UserId,
    ) -> Result<DateTime<Utc>, PersistenceError> {
        self.log_pool("save_block_version");

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!("Failed to acquire connection from pool for block {}: {}", block_id, e);
                return Err(e.into());
            }
        };

        // Snapshot the current content before overwriting it
        let inserted = sqlx::query(
            r#"
            INSERT INTO block_versions (block_id, content, edited_by)
            SELECT id, content, $2 FROM story_blocks WHERE id::text = $1
            "#,
        )
        .bind(block_id)
        .bind(editor)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(PersistenceError::NotFound(format!("block {}", block_id)));
        }

        let edited_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            UPDATE story_blocks
            SET content = $1, last_edited_by = $2, last_edited_at = NOW()
            WHERE id::text = $3
            RETURNING last_edited_at
            "#,
        )
        .bind(content)
        .bind(editor)
        .bind(block_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(edited_at)
    }

    async fn set_lock(
        &self,
        block_id: &str,
        holder: UserId,
        stale_after: ChronoDuration,
    ) -> Result<bool, PersistenceError> {
        self.log_pool("set_lock");

        let result = sqlx::query(
            r#"
            UPDATE story_blocks
            SET locked_by = $1, locked_at = NOW()
            WHERE id::text = $2
              AND (locked_by IS NULL OR locked_by = $1 OR locked_at < NOW() - make_interval(secs => $3))
            "#,
        )
        .bind(holder)
        .bind(block_id)
        .bind(stale_after.num_seconds() as f64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_lock(&self, block_id: &str, holder: UserId) -> Result<bool, PersistenceError> {
        self.log_pool("clear_lock");

        let result = sqlx::query(
            "UPDATE story_blocks SET locked_by = NULL, locked_at = NULL WHERE id::text = $1 AND locked_by = $2",
        )
        .bind(block_id)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_story_content(
        &self,
        story_id: StoryId,
        content: &str,
        editor: UserId,
    ) -> Result<DateTime<Utc>, PersistenceError> {
        self.log_pool("update_story_content");

        let edited_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE stories
            SET content = $1, last_edited_by = $2, last_edited_at = NOW()
            WHERE id = $3
            RETURNING last_edited_at
            "#,
        )
        .bind(content)
        .bind(editor)
        .bind(story_id)
        .fetch_optional(&self.pool)
        .await?;

        edited_at.ok_or_else(|| PersistenceError::NotFound(format!("story {}", story_id)))
    }

    async fn find_username(&self, user_id: UserId) -> Result<Option<String>, PersistenceError> {
        let username: Option<String> = sqlx::query_scalar("SELECT username FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(username)
    }
}
