//! In-memory tunnel registry: dual index by tunnel id and subdomain.
//!
//! Readers run concurrently; writers serialize on the inner lock. Both
//! indices always point at the same record while a tunnel lives.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use super::record::{TunnelEntry, TunnelSnapshot, TunnelStatus};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tunnel with id {0} already exists")]
    DuplicateId(Uuid),
    #[error("subdomain {0} is already taken")]
    DuplicateSubdomain(String),
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<Uuid, Arc<TunnelEntry>>,
    by_subdomain: HashMap<String, Arc<TunnelEntry>>,
}

#[derive(Default)]
pub struct TunnelRegistry {
    inner: RwLock<Indexes>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert into both indices atomically; on a duplicate neither index is
    /// touched.
    pub fn register(&self, entry: Arc<TunnelEntry>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap();
        if inner.by_id.contains_key(&entry.tunnel_id) {
            return Err(RegistryError::DuplicateId(entry.tunnel_id));
        }
        if inner.by_subdomain.contains_key(&entry.subdomain) {
            return Err(RegistryError::DuplicateSubdomain(entry.subdomain.clone()));
        }
        inner.by_id.insert(entry.tunnel_id, Arc::clone(&entry));
        inner.by_subdomain.insert(entry.subdomain.clone(), entry);
        Ok(())
    }

    pub fn by_id(&self, id: &Uuid) -> Option<Arc<TunnelEntry>> {
        self.inner.read().unwrap().by_id.get(id).cloned()
    }

    pub fn by_subdomain(&self, subdomain: &str) -> Option<Arc<TunnelEntry>> {
        self.inner
            .read()
            .unwrap()
            .by_subdomain
            .get(subdomain)
            .cloned()
    }

    /// Drop both indices for `id`, returning the removed entry.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<TunnelEntry>> {
        let mut inner = self.inner.write().unwrap();
        let entry = inner.by_id.remove(id)?;
        inner.by_subdomain.remove(&entry.subdomain);
        Some(entry)
    }

    /// Snapshot of every live entry; callers never hold the lock.
    pub fn list(&self) -> Vec<Arc<TunnelEntry>> {
        self.inner.read().unwrap().by_id.values().cloned().collect()
    }

    /// Snapshot copies of tunnels currently in `active`.
    pub fn list_active(&self) -> Vec<TunnelSnapshot> {
        self.list()
            .into_iter()
            .filter(|entry| entry.status() == TunnelStatus::Active)
            .map(|entry| entry.snapshot())
            .collect()
    }

    /// Every live entry for a user. Registry entries are by definition
    /// `connecting` or `active`, so this doubles as the per-user cap count:
    /// freshly created `connecting` records reserve a slot.
    pub fn by_user(&self, user_id: &str) -> Vec<Arc<TunnelEntry>> {
        self.inner
            .read()
            .unwrap()
            .by_id
            .values()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
