use std::collections::{HashMap, HashSet};
use tracing::error;
use uuid::Uuid;

use crate::models::{SendMessage, StoryId};
use super::connctx::{ConnectionRegistry, Outbound};

/// Who an event is delivered to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience {
    /// Connections subscribed to the story.
    Story(StoryId),
    /// A single connection.
    Connection(Uuid),
    /// Every live connection.
    Everyone,
}

/// Story-keyed subscriber index and fan-out.
///
/// Delivery is fire-and-forget; per-connection order follows the order
/// `broadcast` is called in because each connection has one FIFO queue.
#[derive(Default)]
pub struct BroadcastRouter {
    subscribers: HashMap<StoryId, HashSet<Uuid>>,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true on first subscription.
    pub fn subscribe(&mut self, conn_id: Uuid, story_id: StoryId) -> bool {
        self.subscribers.entry(story_id).or_default().insert(conn_id)
    }

    pub fn unsubscribe(&mut self, conn_id: Uuid, story_id: StoryId) -> bool {
        let Some(set) = self.subscribers.get_mut(&story_id) else {
            return false;
        };
        let removed = set.remove(&conn_id);
        if set.is_empty() {
            self.subscribers.remove(&story_id);
        }
        removed
    }

    pub fn unsubscribe_all(&mut self, conn_id: Uuid) {
        self.subscribers.retain(|_, set| {
            set.remove(&conn_id);
            !set.is_empty()
        });
    }

    #[cfg(test)]
    pub fn audience_size(&self, story_id: StoryId) -> usize {
        self.subscribers.get(&story_id).map_or(0, |s| s.len())
    }

    pub fn story_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Serialize once and queue for every connection in the audience.
    /// Returns the number of connections the frame was queued for.
    pub fn broadcast(&self, registry: &ConnectionRegistry, audience: Audience, message: &SendMessage) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        match audience {
            Audience::Story(story_id) => {
                if let Some(conns) = self.subscribers.get(&story_id) {
                    for ctx in conns.iter().filter_map(|id| registry.get(*id)) {
                        if ctx.send(Outbound::Text(text.clone())) {
                            delivered += 1;
                        }
                    }
                }
            }
            Audience::Connection(id) => {
                if let Some(ctx) = registry.get(id) {
                    if ctx.send(Outbound::Text(text)) {
                        delivered += 1;
                    }
                }
            }
            Audience::Everyone => {
                registry.for_each_live(|ctx| {
                    if ctx.send(Outbound::Text(text.clone())) {
                        delivered += 1;
                    }
                });
            }
        }
        delivered
    }
}
