//! Block locking state machine: `Unlocked -> Locked(holder) -> Unlocked`.
//!
//! Purely in-memory and synchronous. Callers serialize access (the hub
//! holds it behind its state mutex) and persist outcomes afterwards.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{LockView, StoryId};
use crate::services::auth_service::Identity;

#[derive(Clone, Debug, PartialEq)]
pub struct BlockLock {
    pub block_id: String,
    pub story_id: StoryId,
    pub holder: Identity,
    /// Connection the lock was acquired through; released when it goes away.
    pub conn_id: Uuid,
    pub acquired_at: DateTime<Utc>,
}

impl BlockLock {
    pub fn view(&self) -> LockView {
        LockView {
            block_id: self.block_id.clone(),
            user_id: self.holder.user_id,
            username: self.holder.username.clone(),
            locked_at: self.acquired_at,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum LockOutcome {
    Granted,
    /// The requester already held it; acquisition time refreshed.
    Refreshed,
    /// A stale lock held by someone else was taken over.
    Reclaimed(BlockLock),
    /// Held by someone else and not stale. Nothing changed.
    Denied { holder: Identity },
}

impl LockOutcome {
    pub fn acquired(&self) -> bool {
        !matches!(self, LockOutcome::Denied { .. })
    }
}

pub struct LockManager {
    locks: HashMap<String, BlockLock>,
    stale_after: Duration,
}

impl LockManager {
    pub fn new(stale_after: Duration) -> Self {
        Self { locks: HashMap::new(), stale_after }
    }

    pub fn lock(
        &mut self,
        block_id: &str,
        story_id: StoryId,
        requester: &Identity,
        conn_id: Uuid,
        now: DateTime<Utc>,
    ) -> LockOutcome {
        let outcome = match self.locks.get(block_id) {
            None => LockOutcome::Granted,
            Some(current) if current.holder.user_id == requester.user_id => LockOutcome::Refreshed,
            Some(current) if now - current.acquired_at > self.stale_after => {
                LockOutcome::Reclaimed(current.clone())
            }
            Some(current) => {
                return LockOutcome::Denied { holder: current.holder.clone() };
            }
        };

        self.locks.insert(
            block_id.to_string(),
            BlockLock {
                block_id: block_id.to_string(),
                story_id,
                holder: requester.clone(),
                conn_id,
                acquired_at: now,
            },
        );
        outcome
    }

    /// Releases the lock if `requester` holds it.
    pub fn unlock(&mut self, block_id: &str, requester: &Identity) -> Option<BlockLock> {
        match self.locks.get(block_id) {
            Some(current) if current.holder.user_id == requester.user_id => self.locks.remove(block_id),
            _ => None,
        }
    }

    /// Releases every lock acquired through `conn_id`.
    pub fn release_held_by(&mut self, conn_id: Uuid) -> Vec<BlockLock> {
        let blocks: Vec<String> = self
            .locks
            .values()
            .filter(|l| l.conn_id == conn_id)
            .map(|l| l.block_id.clone())
            .collect();
        blocks.iter().filter_map(|b| self.locks.remove(b)).collect()
    }

    #[cfg(test)]
    pub fn holder(&self, block_id: &str) -> Option<&BlockLock> {
        self.locks.get(block_id)
    }

    pub fn locks_for_story(&self, story_id: StoryId) -> Vec<&BlockLock> {
        let mut locks: Vec<&BlockLock> = self.locks.values().filter(|l| l.story_id == story_id).collect();
        locks.sort_by(|a, b| a.block_id.cmp(&b.block_id));
        locks
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(id: i64, name: &str) -> Identity {
        Identity { user_id: id, username: name.to_string() }
    }

    fn manager() -> LockManager {
        LockManager::new(Duration::minutes(5))
    }

    #[test]
    fn second_requester_is_denied_while_fresh() {
        let mut locks = manager();
        let (a, b) = (ident(1, "ann"), ident(2, "bo"));
        let (ca, cb) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Utc::now();

        assert_eq!(locks.lock("b1", 42, &a, ca, t0), LockOutcome::Granted);
        assert_eq!(
            locks.lock("b1", 42, &b, cb, t0 + Duration::minutes(4)),
            LockOutcome::Denied { holder: a.clone() }
        );
        assert_eq!(locks.holder("b1").unwrap().holder, a);
        assert_eq!(locks.holder("b1").unwrap().acquired_at, t0);
    }

    #[test]
    fn stale_lock_is_reclaimable_without_unlock() {
        let mut locks = manager();
        let (a, b) = (ident(1, "ann"), ident(2, "bo"));
        let t0 = Utc::now();
        let cb = Uuid::new_v4();

        locks.lock("b1", 42, &a, Uuid::new_v4(), t0);
        let outcome = locks.lock("b1", 42, &b, cb, t0 + Duration::minutes(5) + Duration::seconds(1));
        assert!(matches!(outcome, LockOutcome::Reclaimed(ref prev) if prev.holder == a));
        assert_eq!(locks.holder("b1").unwrap().holder, b);
        assert_eq!(locks.holder("b1").unwrap().conn_id, cb);
    }

    #[test]
    fn relock_by_holder_refreshes() {
        let mut locks = manager();
        let a = ident(1, "ann");
        let t0 = Utc::now();
        locks.lock("b1", 42, &a, Uuid::new_v4(), t0);
        let later = t0 + Duration::minutes(3);
        assert_eq!(locks.lock("b1", 42, &a, Uuid::new_v4(), later), LockOutcome::Refreshed);
        assert_eq!(locks.holder("b1").unwrap().acquired_at, later);
    }

    #[test]
    fn unlock_requires_holder() {
        let mut locks = manager();
        let (a, b) = (ident(1, "ann"), ident(2, "bo"));
        locks.lock("b1", 42, &a, Uuid::new_v4(), Utc::now());

        assert!(locks.unlock("b1", &b).is_none());
        assert!(locks.holder("b1").is_some());
        assert!(locks.unlock("b1", &a).is_some());
        assert!(locks.holder("b1").is_none());
        assert!(locks.unlock("b1", &a).is_none());
    }

    #[test]
    fn release_held_by_only_touches_that_connection() {
        let mut locks = manager();
        let (a, b) = (ident(1, "ann"), ident(2, "bo"));
        let (ca, cb) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        locks.lock("b1", 1, &a, ca, now);
        locks.lock("b2", 1, &a, ca, now);
        locks.lock("b3", 2, &a, ca, now);
        locks.lock("b4", 1, &b, cb, now);

        let mut released: Vec<String> = locks.release_held_by(ca).into_iter().map(|l| l.block_id).collect();
        released.sort();
        assert_eq!(released, vec!["b1", "b2", "b3"]);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks.holder("b4").unwrap().holder, b);
        assert!(locks.release_held_by(ca).is_empty());
    }

    #[test]
    fn locks_for_story_are_sorted() {
        let mut locks = manager();
        let a = ident(1, "ann");
        let now = Utc::now();
        locks.lock("z", 1, &a, Uuid::new_v4(), now);
        locks.lock("a", 1, &a, Uuid::new_v4(), now);
        locks.lock("m", 2, &a, Uuid::new_v4(), now);
        let ids: Vec<&str> = locks.locks_for_story(1).iter().map(|l| l.block_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "z"]);
    }
}
