use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;
use uuid::Uuid;

use crate::services::auth_service::Identity;

/// One frame queued for a connection's writer task.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// Serialized JSON message.
    Text(String),
    /// Transport-level liveness probe.
    Probe,
}

#[derive(Debug)]
pub struct ConnCtx {
    pub id: Uuid,
    pub identity: Identity,
    pub alive: bool,
    pub created_at: DateTime<Utc>,
    tx: mpsc::Sender<Outbound>,
}

impl ConnCtx {
    /// Queue a frame without waiting. A full or closed queue drops it.
    pub fn send(&self, frame: Outbound) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %self.id, "Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Result of one liveness sweep.
#[derive(Debug, Default)]
pub struct SweepResult {
    pub probed: usize,
    /// Connections that missed the previous probe. Already removed.
    pub evicted: Vec<ConnCtx>,
}

/// Every live connection, keyed by connection id.
///
/// Dropping a `ConnCtx` drops its sender, which ends that connection's
/// writer task and with it the transport.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: HashMap<Uuid, ConnCtx>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, identity: Identity, tx: mpsc::Sender<Outbound>) -> Uuid {
        let id = Uuid::new_v4();
        self.conns.insert(
            id,
            ConnCtx {
                id,
                identity,
                alive: true,
                created_at: Utc::now(),
                tx,
            },
        );
        id
    }

    pub fn remove(&mut self, id: Uuid) -> Option<ConnCtx> {
        self.conns.remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&ConnCtx> {
        self.conns.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.conns.contains_key(&id)
    }

    /// Probe acknowledged or the client sent its own heartbeat.
    pub fn mark_alive(&mut self, id: Uuid) -> bool {
        match self.conns.get_mut(&id) {
            Some(ctx) => {
                ctx.alive = true;
                true
            }
            None => false,
        }
    }

    pub fn for_each_live(&self, mut f: impl FnMut(&ConnCtx)) {
        self.conns.values().filter(|c| c.alive).for_each(|c| f(c));
    }

    /// Two-strike liveness: connections still unacknowledged from the last
    /// sweep are evicted, every other connection is flagged and probed.
    pub fn sweep(&mut self) -> SweepResult {
        let dead: Vec<Uuid> = self.conns.values().filter(|c| !c.alive).map(|c| c.id).collect();
        let evicted = dead.into_iter().filter_map(|id| self.conns.remove(&id)).collect();

        let mut probed = 0;
        for ctx in self.conns.values_mut() {
            ctx.alive = false;
            ctx.send(Outbound::Probe);
            probed += 1;
        }
        SweepResult { probed, evicted }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }
}
