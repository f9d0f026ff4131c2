//! Persistence gateway seen by the session layer.
//!
//! The session layer never owns storage. It calls through this trait and
//! treats every call as best-effort: in-memory state stays authoritative.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::models::{PersistenceError, StoryId, UserId};

/// Persisted view of one story block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub id: String,
    pub story_id: StoryId,
    pub content: String,
    pub locked_by: Option<UserId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_edited_by: Option<UserId>,
    pub last_edited_at: Option<DateTime<Utc>>,
}

/// Append-only content history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentVersion {
    pub target: String,
    pub content: String,
    pub edited_by: UserId,
    pub edited_at: DateTime<Utc>,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Short backend name reported by readiness checks.
    fn backend(&self) -> &'static str;

    async fn load_block(&self, block_id: &str) -> Result<Option<BlockRecord>, PersistenceError>;

    /// Record the block's previous content as a version and store the new
    /// content. Returns the edit timestamp.
    async fn save_block_version(
        &self,
        block_id: &str,
        content: &str,
        editor: UserId,
    ) -> Result<DateTime<Utc>, PersistenceError>;

    /// Conditional lock write: succeeds when the block is unlocked, already
    /// held by `holder`, or its lock is older than `stale_after`.
    /// Returns whether the persisted lock now names `holder`.
    async fn set_lock(
        &self,
        block_id: &str,
        holder: UserId,
        stale_after: Duration,
    ) -> Result<bool, PersistenceError>;

    /// Clears the persisted lock if `holder` owns it. Returns whether a lock was cleared.
    async fn clear_lock(&self, block_id: &str, holder: UserId) -> Result<bool, PersistenceError>;

    /// Stores whole-story content and returns the recorded `last_edited_at`.
    async fn update_story_content(
        &self,
        story_id: StoryId,
        content: &str,
        editor: UserId,
    ) -> Result<DateTime<Utc>, PersistenceError>;

    async fn find_username(&self, user_id: UserId) -> Result<Option<String>, PersistenceError>;
}

#[derive(Default)]
struct MemoryStore {
    blocks: HashMap<String, BlockRecord>,
    stories: HashMap<StoryId, (String, UserId, DateTime<Utc>)>,
    versions: Vec<ContentVersion>,
    users: HashMap<UserId, String>,
}

/// Process-local gateway. Used when no database is configured and by tests,
/// which can switch it into a failing mode.
#[derive(Default)]
pub struct MemoryGateway {
    store: Mutex<MemoryStore>,
    failing: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every subsequent call, like a slow database.
    pub fn set_latency(&self, latency: std::time::Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn insert_user(&self, user_id: UserId, username: &str) {
        self.store.lock().await.users.insert(user_id, username.to_string());
    }

    pub async fn insert_block(&self, story_id: StoryId, block_id: &str, content: &str) {
        self.store.lock().await.blocks.insert(
            block_id.to_string(),
            BlockRecord {
                id: block_id.to_string(),
                story_id,
                content: content.to_string(),
                locked_by: None,
                locked_at: None,
                last_edited_by: None,
                last_edited_at: None,
            },
        );
    }

    pub async fn versions(&self) -> Vec<ContentVersion> {
        self.store.lock().await.versions.clone()
    }

    pub async fn story_content(&self, story_id: StoryId) -> Option<String> {
        self.store.lock().await.stories.get(&story_id).map(|(c, _, _)| c.clone())
    }

    async fn check(&self) -> Result<(), PersistenceError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory gateway is failing".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn load_block(&self, block_id: &str) -> Result<Option<BlockRecord>, PersistenceError> {
        self.check().await?;
        Ok(self.store.lock().await.blocks.get(block_id).cloned())
    }

    async fn save_block_version(
        &self,
        block_id: &str,
        content: &str,
        editor: UserId,
    ) -> Result<DateTime<Utc>, PersistenceError> {
        self.check().await?;
        let now = Utc::now();
        let mut store = self.store.lock().await;
        let block = store
            .blocks
            .get_mut(block_id)
            .ok_or_else(|| PersistenceError::NotFound(format!("block {block_id}")))?;
        let previous = std::mem::replace(&mut block.content, content.to_string());
        block.last_edited_by = Some(editor);
        block.last_edited_at = Some(now);
        store.versions.push(ContentVersion {
            target: block_id.to_string(),
            content: previous,
            edited_by: editor,
            edited_at: now,
        });
        Ok(now)
    }

    async fn set_lock(
        &self,
        block_id: &str,
        holder: UserId,
        stale_after: Duration,
    ) -> Result<bool, PersistenceError> {
        self.check().await?;
        let now = Utc::now();
        let mut store = self.store.lock().await;
        let Some(block) = store.blocks.get_mut(block_id) else {
            return Ok(false);
        };
        let reclaimable = match (block.locked_by, block.locked_at) {
            (None, _) => true,
            (Some(current), _) if current == holder => true,
            (Some(_), Some(at)) => at < now - stale_after,
            (Some(_), None) => true,
        };
        if reclaimable {
            block.locked_by = Some(holder);
            block.locked_at = Some(now);
        }
        Ok(reclaimable)
    }

    async fn clear_lock(&self, block_id: &str, holder: UserId) -> Result<bool, PersistenceError> {
        self.check().await?;
        let mut store = self.store.lock().await;
        match store.blocks.get_mut(block_id) {
            Some(block) if block.locked_by == Some(holder) => {
                block.locked_by = None;
                block.locked_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_story_content(
        &self,
        story_id: StoryId,
        content: &str,
        editor: UserId,
    ) -> Result<DateTime<Utc>, PersistenceError> {
        self.check().await?;
        let now = Utc::now();
        let mut store = self.store.lock().await;
        store.stories.insert(story_id, (content.to_string(), editor, now));
        store.versions.push(ContentVersion {
            target: format!("story:{story_id}"),
            content: content.to_string(),
            edited_by: editor,
            edited_at: now,
        });
        Ok(now)
    }

    async fn find_username(&self, user_id: UserId) -> Result<Option<String>, PersistenceError> {
        self.check().await?;
        Ok(self.store.lock().await.users.get(&user_id).cloned())
    }
}
