use moka::sync::Cache;
use std::time::Duration;
use tracing::{error, info};

use crate::models::UserId;
use crate::services::persistence::PersistenceGateway;

/// Display names of editors, as stored by the account service.
pub struct DisplayNameCache {
    cache: Cache<UserId, String>,
}

impl DisplayNameCache {
    pub fn new() -> Self {
        let cache = Cache::builder()
            .max_capacity(100_000)
            .time_to_idle(Duration::from_secs(5 * 60))
            .build();
        info!("Display name cache initialized");
        Self { cache }
    }

    /// Resolve the stored display name for `user_id`, falling back to
    /// `fallback` when the lookup misses or fails. Failures are not cached.
    pub async fn resolve(
        &self,
        gateway: &dyn PersistenceGateway,
        timeout: Duration,
        user_id: UserId,
        fallback: &str,
    ) -> String {
        if let Some(name) = self.cache.get(&user_id) {
            return name;
        }

        match tokio::time::timeout(timeout, gateway.find_username(user_id)).await {
            Ok(Ok(Some(name))) => {
                self.cache.insert(user_id, name.clone());
                name
            }
            Ok(Ok(None)) => fallback.to_string(),
            Ok(Err(e)) => {
                error!(user_id, "Failed to resolve display name: {}", e);
                fallback.to_string()
            }
            Err(_) => {
                error!(user_id, "Display name lookup timed out after {:?}", timeout);
                fallback.to_string()
            }
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl Default for DisplayNameCache {
    fn default() -> Self {
        Self::new()
    }
}
