//! Registry of live peer connections keyed by node name
//!
//! At most one connection per name is registered at any instant. The lock is
//! only held to look up or swap entries; socket writes happen outside it.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinSet;

use super::NodeName;
use super::peer::{NodeStatus, Peer};
use crate::error::{Result, SkeinError};

/// Returned by [`ConnectionPool::add`] when the name is already taken
#[derive(Debug, Clone)]
pub struct DuplicateName {
    pub existing: Arc<Peer>,
}

impl fmt::Display for DuplicateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is already connected ({} {} -> {})",
            self.existing.name(),
            self.existing.direction(),
            self.existing.local_addr(),
            self.existing.remote_addr()
        )
    }
}

impl From<DuplicateName> for SkeinError {
    fn from(err: DuplicateName) -> Self {
        SkeinError::DuplicateName(err.to_string())
    }
}

#[derive(Debug, Default)]
pub struct ConnectionPool {
    peers: RwLock<HashMap<NodeName, Arc<Peer>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Never overwrites an existing entry.
    pub fn add(&self, peer: Arc<Peer>) -> std::result::Result<(), DuplicateName> {
        let mut peers = self.peers.write();
        if let Some(existing) = peers.get(peer.name()) {
            return Err(DuplicateName {
                existing: existing.clone(),
            });
        }
        peers.insert(peer.name().clone(), peer);
        Ok(())
    }

    /// Swap `old` for `new` if `old` is still the registered entry.
    ///
    /// Returns false when the entry changed in the meantime; the pool is left
    /// untouched in that case.
    pub fn replace(&self, old: &Arc<Peer>, new: Arc<Peer>) -> bool {
        let mut peers = self.peers.write();
        match peers.get(old.name()) {
            Some(current) if Arc::ptr_eq(current, old) => {
                peers.insert(new.name().clone(), new);
                true
            }
            _ => false,
        }
    }

    /// Deregister `peer`, but only if it is the connection currently registered
    /// under its name. A stale connection never evicts its replacement.
    pub fn remove(&self, peer: &Arc<Peer>) -> bool {
        let mut peers = self.peers.write();
        match peers.get(peer.name()) {
            Some(current) if Arc::ptr_eq(current, peer) => {
                peers.remove(peer.name());
                true
            }
            _ => false,
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.peers.read().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(name).cloned()
    }

    pub fn count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn names(&self) -> Vec<NodeName> {
        let mut names: Vec<NodeName> = self.peers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.name().cmp(b.name()));
        peers
    }

    pub async fn write_to(&self, name: &str, frame: &[u8]) -> Result<()> {
        let peer = self
            .get(name)
            .ok_or_else(|| SkeinError::NodeNotFound(name.to_string()))?;
        peer.write_frame(frame).await
    }

    /// Best effort write to every registered peer. Peers are written
    /// concurrently, so a peer that stopped reading delays the others by
    /// nothing. Every failure is collected.
    pub async fn write_all(&self, frame: &[u8]) -> Result<()> {
        let frame: Arc<[u8]> = Arc::from(frame);
        let mut writes = JoinSet::new();
        for peer in self.snapshot() {
            let frame = frame.clone();
            writes.spawn(async move { peer.write_frame(&frame).await });
        }

        let mut errors = Vec::new();
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e.to_string()),
                Err(e) => errors.push(format!("write task failed: {}", e)),
            }
        }
        errors.sort();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SkeinError::Write(errors.join("; ")))
        }
    }

    pub fn set_lag(&self, name: &str, lag: chrono::Duration) {
        if let Some(peer) = self.get(name) {
            peer.set_lag(lag);
        }
    }

    pub fn set_status(&self, name: &str, status: NodeStatus) {
        if let Some(peer) = self.get(name) {
            peer.set_status(status);
        }
    }

    pub fn set_error(&self, name: &str, error: Option<String>) {
        if let Some(peer) = self.get(name) {
            peer.set_error(error);
        }
    }

    pub fn increment_packet_count(&self, name: &str) {
        if let Some(peer) = self.get(name) {
            peer.increment_packet_count();
        }
    }

    /// Cancel the connection registered under `name`. The read loop owning it
    /// deregisters it on the way out.
    pub fn close(&self, name: &str) -> bool {
        match self.get(name) {
            Some(peer) => {
                peer.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        for peer in self.snapshot() {
            peer.close();
        }
    }
}
