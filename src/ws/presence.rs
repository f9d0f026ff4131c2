use std::collections::{BTreeSet, HashMap};

use crate::models::StoryId;

/// Per-story sets of display names currently typing. Ephemeral.
#[derive(Default)]
pub struct PresenceTracker {
    typing: HashMap<StoryId, BTreeSet<String>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the name was not already present.
    pub fn start_typing(&mut self, story_id: StoryId, username: &str) -> bool {
        self.typing.entry(story_id).or_default().insert(username.to_string())
    }

    /// Returns true if the name was present. Absent names are a no-op.
    pub fn stop_typing(&mut self, story_id: StoryId, username: &str) -> bool {
        let Some(set) = self.typing.get_mut(&story_id) else {
            return false;
        };
        let removed = set.remove(username);
        if set.is_empty() {
            self.typing.remove(&story_id);
        }
        removed
    }

    /// Removes `username` from every set, returning the affected stories.
    pub fn remove_everywhere(&mut self, username: &str) -> Vec<StoryId> {
        let mut affected: Vec<StoryId> = self
            .typing
            .iter_mut()
            .filter_map(|(story, set)| set.remove(username).then_some(*story))
            .collect();
        self.typing.retain(|_, set| !set.is_empty());
        affected.sort_unstable();
        affected
    }

    pub fn typing_in(&self, story_id: StoryId) -> Vec<String> {
        self.typing
            .get(&story_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total typing entries across stories.
    pub fn len(&self) -> usize {
        self.typing.values().map(|s| s.len()).sum()
    }
}
