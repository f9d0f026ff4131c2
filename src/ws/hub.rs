//! Session coordinator.
//!
//! Owns the connection registry, lock manager, presence tracker and
//! broadcast router behind a single mutex, so every state transition and
//! the broadcast it causes happen in one critical section. Persistence
//! calls run outside that section, bounded by a timeout, and never roll
//! back in-memory state (memory first, storage eventually).

use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::models::{PersistenceError, ReceivedMessage, SendMessage, SessionError, StoryId, UserId};
use crate::services::auth_service::Identity;
use crate::services::persistence::PersistenceGateway;
use super::broadcast::{Audience, BroadcastRouter};
use super::connctx::{ConnCtx, ConnectionRegistry, Outbound};
use super::locks::{BlockLock, LockManager, LockOutcome};
use super::presence::PresenceTracker;
use super::userctx::DisplayNameCache;

#[derive(Clone, Debug)]
pub struct HubSettings {
    pub lock_stale_after: chrono::Duration,
    pub persistence_timeout: Duration,
    pub outbound_queue_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for HubSettings {
    fn from(config: &Config) -> Self {
        Self {
            lock_stale_after: config.lock_stale_after(),
            persistence_timeout: config.persistence_timeout(),
            outbound_queue_capacity: config.outbound_queue_capacity.max(1),
        }
    }
}

/// Point-in-time counters for diagnostics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HubSnapshot {
    pub n_conn: usize,
    pub n_live_conn: usize,
    pub n_stories: usize,
    pub n_locks: usize,
    pub n_typing: usize,
    pub n_lock_divergences: u64,
}

struct HubState {
    registry: ConnectionRegistry,
    locks: LockManager,
    presence: PresenceTracker,
    router: BroadcastRouter,
}

pub struct SessionHub {
    state: Mutex<HubState>,
    gateway: Arc<dyn PersistenceGateway>,
    names: DisplayNameCache,
    settings: HubSettings,
    lock_divergences: AtomicU64,
}

impl SessionHub {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, settings: HubSettings) -> Self {
        Self {
            state: Mutex::new(HubState {
                registry: ConnectionRegistry::new(),
                locks: LockManager::new(settings.lock_stale_after),
                presence: PresenceTracker::new(),
                router: BroadcastRouter::new(),
            }),
            gateway,
            names: DisplayNameCache::new(),
            settings,
            lock_divergences: AtomicU64::new(0),
        }
    }

    pub fn persistence_backend(&self) -> &'static str {
        self.gateway.backend()
    }

    /// Register an authenticated connection and queue its `connected` frame.
    pub async fn admit(&self, identity: Identity, story_id: Option<StoryId>) -> (Uuid, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.settings.outbound_queue_capacity);
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let connected = SendMessage::Connected {
            user_id: identity.user_id,
            username: identity.username.clone(),
        };
        let conn_id = state.registry.admit(identity, tx);
        if let Some(story_id) = story_id {
            state.router.subscribe(conn_id, story_id);
        }
        state.router.broadcast(&state.registry, Audience::Connection(conn_id), &connected);
        info!(%conn_id, connections = state.registry.len(), "Connection admitted");
        (conn_id, rx)
    }

    pub async fn mark_alive(&self, conn_id: Uuid) {
        self.state.lock().await.registry.mark_alive(conn_id);
    }

    /// Decode one inbound text frame and dispatch it.
    pub async fn handle_text(&self, conn_id: Uuid, text: &str) {
        let msg = match serde_json::from_str::<ReceivedMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                let err = SessionError::MalformedMessage(e.to_string());
                warn!(%conn_id, "{}", err);
                self.send_error(conn_id, "Failed to process message", Some(e.to_string())).await;
                return;
            }
        };

        let identity = {
            let state = self.state.lock().await;
            match state.registry.get(conn_id) {
                Some(ctx) => ctx.identity.clone(),
                None => return,
            }
        };

        debug!(%conn_id, user_id = identity.user_id, story_id = ?msg.story_id(), "Received {:?}", msg);
        self.dispatch(conn_id, &identity, msg).await;
    }

    /// Report a frame that could not be handled to its sender only.
    pub async fn reject_frame(&self, conn_id: Uuid, reason: &str) {
        warn!(%conn_id, "Rejected frame: {}", reason);
        self.send_error(conn_id, "Failed to process message", Some(reason.to_string())).await;
    }

    async fn dispatch(&self, conn_id: Uuid, identity: &Identity, msg: ReceivedMessage) {
        match msg {
            ReceivedMessage::Ping => self.mark_alive(conn_id).await,

            ReceivedMessage::JoinStory(m) => {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                if !state.registry.contains(conn_id) {
                    return;
                }
                state.router.subscribe(conn_id, m.story_id);
                let snapshot = SendMessage::StoryState {
                    story_id: m.story_id,
                    locks: state.locks.locks_for_story(m.story_id).iter().map(|l| l.view()).collect(),
                    typing: state.presence.typing_in(m.story_id),
                };
                state.router.broadcast(&state.registry, Audience::Connection(conn_id), &snapshot);
            }

            ReceivedMessage::LeaveStory(m) => {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                if !state.registry.contains(conn_id) {
                    return;
                }
                state.router.unsubscribe(conn_id, m.story_id);
                if state.presence.stop_typing(m.story_id, &identity.username) {
                    let stop = SendMessage::StopTyping { story_id: m.story_id, username: identity.username.clone() };
                    state.router.broadcast(&state.registry, Audience::Story(m.story_id), &stop);
                }
            }

            ReceivedMessage::LockBlock(m) => {
                let outcome = {
                    let mut guard = self.state.lock().await;
                    let state = &mut *guard;
                    if !state.registry.contains(conn_id) {
                        return;
                    }
                    state.router.subscribe(conn_id, m.story_id);
                    let outcome = state.locks.lock(&m.block_id, m.story_id, identity, conn_id, Utc::now());
                    if outcome.acquired() {
                        let locked = SendMessage::LockBlock {
                            block_id: m.block_id.clone(),
                            story_id: m.story_id,
                            user_id: identity.user_id,
                            username: identity.username.clone(),
                        };
                        state.router.broadcast(&state.registry, Audience::Story(m.story_id), &locked);
                    }
                    outcome
                };

                match outcome {
                    LockOutcome::Denied { holder } => {
                        debug!(block_id = %m.block_id, requester = identity.user_id, holder = holder.user_id, "Lock request ignored, block is held");
                        return;
                    }
                    LockOutcome::Reclaimed(previous) => {
                        info!(block_id = %m.block_id, previous = previous.holder.user_id, holder = identity.user_id, "Reclaimed stale lock");
                    }
                    LockOutcome::Granted | LockOutcome::Refreshed => {}
                }

                let stale_after = self.settings.lock_stale_after;
                match self.persist(self.gateway.set_lock(&m.block_id, identity.user_id, stale_after)).await {
                    Ok(true) => {}
                    Ok(false) => self.note_lock_divergence(&m.block_id, identity.user_id, "persisted lock held by another user or block missing"),
                    Err(e) => self.note_lock_divergence(&m.block_id, identity.user_id, &e.to_string()),
                }
            }

            ReceivedMessage::UnlockBlock(m) => {
                let released = {
                    let mut guard = self.state.lock().await;
                    let state = &mut *guard;
                    if !state.registry.contains(conn_id) {
                        return;
                    }
                    state.router.subscribe(conn_id, m.story_id);
                    let released = state.locks.unlock(&m.block_id, identity);
                    if let Some(lock) = &released {
                        let unlocked = SendMessage::UnlockBlock { block_id: lock.block_id.clone(), story_id: lock.story_id };
                        state.router.broadcast(&state.registry, Audience::Story(lock.story_id), &unlocked);
                    }
                    released
                };

                match released {
                    Some(lock) => self.persist_releases(vec![lock]).await,
                    None => debug!(block_id = %m.block_id, requester = identity.user_id, "Unlock ignored, requester is not the holder"),
                }
            }

            ReceivedMessage::UpdateBlock(m) => {
                if !self.subscribe(conn_id, m.story_id).await {
                    return;
                }

                let last_edited_at = match self.persist(self.gateway.save_block_version(&m.block_id, &m.content, identity.user_id)).await {
                    Ok(at) => at,
                    Err(e) => {
                        warn!(block_id = %m.block_id, "Block edit not persisted, broadcasting in-memory value: {}", e);
                        Utc::now()
                    }
                };

                let updated = SendMessage::UpdateBlock {
                    block_id: m.block_id,
                    story_id: m.story_id,
                    content: m.content,
                    user_id: identity.user_id,
                    username: identity.username.clone(),
                    last_edited_at,
                };
                self.broadcast(Audience::Story(m.story_id), &updated).await;
            }

            ReceivedMessage::UpdateStoryContent(m) => {
                if m.user_id.is_some_and(|claimed| claimed != identity.user_id) {
                    warn!(%conn_id, claimed = ?m.user_id, user_id = identity.user_id, "Ignoring client-supplied editor id");
                }
                if !self.subscribe(conn_id, m.story_id).await {
                    return;
                }

                let persisted = self.persist(self.gateway.update_story_content(m.story_id, &m.content, identity.user_id)).await;
                let editor_name = self
                    .names
                    .resolve(self.gateway.as_ref(), self.settings.persistence_timeout, identity.user_id, &identity.username)
                    .await;

                let last_edited_at = match &persisted {
                    Ok(at) => *at,
                    Err(e) => {
                        warn!(story_id = m.story_id, "Story content not persisted, broadcasting in-memory value: {}", e);
                        Utc::now()
                    }
                };

                let updated = SendMessage::StoryContentUpdated {
                    story_id: m.story_id,
                    content: m.content,
                    last_edited_at,
                    user_id: identity.user_id,
                    username: identity.username.clone(),
                    last_edited_by_name: editor_name,
                };
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                state.router.broadcast(&state.registry, Audience::Story(m.story_id), &updated);
                if let Err(e) = persisted {
                    let failure = SendMessage::error("Failed to update story content", Some(e.to_string()));
                    state.router.broadcast(&state.registry, Audience::Connection(conn_id), &failure);
                }
            }

            ReceivedMessage::Typing(m) => {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                if !state.registry.contains(conn_id) {
                    return;
                }
                state.router.subscribe(conn_id, m.story_id);
                state.presence.start_typing(m.story_id, &identity.username);
                let typing = SendMessage::Typing { story_id: m.story_id, username: identity.username.clone() };
                state.router.broadcast(&state.registry, Audience::Story(m.story_id), &typing);
            }

            ReceivedMessage::StopTyping(m) => {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                if !state.registry.contains(conn_id) {
                    return;
                }
                state.router.subscribe(conn_id, m.story_id);
                if state.presence.stop_typing(m.story_id, &identity.username) {
                    let stop = SendMessage::StopTyping { story_id: m.story_id, username: identity.username.clone() };
                    state.router.broadcast(&state.registry, Audience::Story(m.story_id), &stop);
                }
            }
        }
    }

    /// Remove a connection and release everything it held.
    /// Returns false if it was already gone.
    pub async fn disconnect(&self, conn_id: Uuid) -> bool {
        let released = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(ctx) = state.registry.remove(conn_id) else {
                return false;
            };
            let lifetime = Utc::now() - ctx.created_at;
            info!(%conn_id, user_id = ctx.identity.user_id, secs = lifetime.num_seconds(), "Connection closed");
            Self::release_connection(state, &ctx)
        };
        self.persist_releases(released).await;
        true
    }

    /// One liveness round. Returns the number of evicted connections.
    pub async fn sweep(&self) -> usize {
        let (released, evicted) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let result = state.registry.sweep();
            let mut released = Vec::new();
            for ctx in &result.evicted {
                warn!(conn_id = %ctx.id, user_id = ctx.identity.user_id, "Evicting connection after two missed liveness probes");
                released.extend(Self::release_connection(state, ctx));
            }
            debug!(probed = result.probed, evicted = result.evicted.len(), "Liveness sweep");
            (released, result.evicted.len())
        };
        self.persist_releases(released).await;
        evicted
    }

    /// Periodic liveness probing; runs until the task is dropped.
    pub async fn run_liveness(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = self.sweep().await;
            if evicted > 0 {
                info!(evicted, "Liveness sweep evicted connections");
            }
        }
    }

    /// Tell every live connection the server is going away.
    pub async fn shutdown(&self) {
        let notice = SendMessage::error("Server shutting down", None);
        let n = self.broadcast(Audience::Everyone, &notice).await;
        info!(connections = n, "Shutdown notice sent");
    }

    pub async fn snapshot(&self) -> HubSnapshot {
        let state = self.state.lock().await;
        let mut n_live_conn = 0;
        state.registry.for_each_live(|_| n_live_conn += 1);
        HubSnapshot {
            n_conn: state.registry.len(),
            n_live_conn,
            n_stories: state.router.story_count(),
            n_locks: state.locks.len(),
            n_typing: state.presence.len(),
            n_lock_divergences: self.lock_divergences.load(Ordering::Relaxed),
        }
    }

    pub fn display_names(&self) -> &DisplayNameCache {
        &self.names
    }

    fn release_connection(state: &mut HubState, ctx: &ConnCtx) -> Vec<BlockLock> {
        state.router.unsubscribe_all(ctx.id);

        let released = state.locks.release_held_by(ctx.id);
        for lock in &released {
            let unlocked = SendMessage::UnlockBlock { block_id: lock.block_id.clone(), story_id: lock.story_id };
            state.router.broadcast(&state.registry, Audience::Story(lock.story_id), &unlocked);
        }

        for story_id in state.presence.remove_everywhere(&ctx.identity.username) {
            let stop = SendMessage::StopTyping { story_id, username: ctx.identity.username.clone() };
            state.router.broadcast(&state.registry, Audience::Story(story_id), &stop);
        }
        released
    }

    async fn persist_releases(&self, released: Vec<BlockLock>) {
        for lock in released {
            match self.persist(self.gateway.clear_lock(&lock.block_id, lock.holder.user_id)).await {
                Ok(true) => {}
                Ok(false) => self.note_lock_divergence(&lock.block_id, lock.holder.user_id, "no persisted lock to clear"),
                Err(e) => self.note_lock_divergence(&lock.block_id, lock.holder.user_id, &e.to_string()),
            }
        }
    }

    async fn persist<T>(&self, call: impl Future<Output = Result<T, PersistenceError>>) -> Result<T, PersistenceError> {
        let limit = self.settings.persistence_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(PersistenceError::Timeout(limit)),
        }
    }

    fn note_lock_divergence(&self, block_id: &str, user_id: UserId, reason: &str) {
        let divergences = self.lock_divergences.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(block_id, user_id, divergences, "In-memory lock state diverges from storage: {}", reason);
    }

    /// Returns false if the connection is gone.
    async fn subscribe(&self, conn_id: Uuid, story_id: StoryId) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.registry.contains(conn_id) {
            return false;
        }
        state.router.subscribe(conn_id, story_id);
        true
    }

    async fn broadcast(&self, audience: Audience, message: &SendMessage) -> usize {
        let state = self.state.lock().await;
        state.router.broadcast(&state.registry, audience, message)
    }

    async fn send_error(&self, conn_id: Uuid, message: &str, details: Option<String>) {
        self.broadcast(Audience::Connection(conn_id), &SendMessage::error(message, details)).await;
    }
}
