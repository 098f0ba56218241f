//! Identity store contract and an in-memory implementation.

use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::types::{find_duplicate, KnownIdentity};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate identity name: {0}")]
    DuplicateName(String),
    #[error("identity store lock poisoned")]
    Poisoned,
    #[error("identity store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }
}

/// Persistent name → encoding mapping.
///
/// `load` returns an owned snapshot; a decision made against it is never
/// affected by a concurrent write. Every write must keep names unique.
pub trait IdentityStore {
    fn load(&self) -> Result<Vec<KnownIdentity>, StoreError>;

    /// Replace the whole collection. Rejects duplicate names without writing.
    fn save(&self, identities: &[KnownIdentity]) -> Result<(), StoreError>;

    /// Add one identity. Backends should override this with an atomic write.
    fn insert(&self, identity: KnownIdentity) -> Result<(), StoreError> {
        let mut all = self.load()?;
        if all.iter().any(|known| known.name == identity.name) {
            return Err(StoreError::DuplicateName(identity.name));
        }
        all.push(identity);
        self.save(&all)
    }

    /// Remove by name. Returns whether an entry was removed.
    fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let mut all = self.load()?;
        let before = all.len();
        all.retain(|known| known.name != name);
        if all.len() == before {
            return Ok(false);
        }
        self.save(&all)?;
        Ok(true)
    }
}

impl<T: IdentityStore + ?Sized> IdentityStore for Arc<T> {
    fn load(&self) -> Result<Vec<KnownIdentity>, StoreError> {
        (**self).load()
    }

    fn save(&self, identities: &[KnownIdentity]) -> Result<(), StoreError> {
        (**self).save(identities)
    }

    fn insert(&self, identity: KnownIdentity) -> Result<(), StoreError> {
        (**self).insert(identity)
    }

    fn remove(&self, name: &str) -> Result<bool, StoreError> {
        (**self).remove(name)
    }
}

/// Process-local store. Reads clone the collection under a read lock.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<Vec<KnownIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(identities: Vec<KnownIdentity>) -> Result<Self, StoreError> {
        if let Some(dup) = find_duplicate(&identities) {
            return Err(StoreError::DuplicateName(dup.to_string()));
        }
        Ok(Self {
            identities: RwLock::new(identities),
        })
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Vec<KnownIdentity>, StoreError> {
        let guard = self.identities.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.clone())
    }

    fn save(&self, identities: &[KnownIdentity]) -> Result<(), StoreError> {
        if let Some(dup) = find_duplicate(identities) {
            return Err(StoreError::DuplicateName(dup.to_string()));
        }
        let mut guard = self.identities.write().map_err(|_| StoreError::Poisoned)?;
        *guard = identities.to_vec();
        Ok(())
    }

    fn insert(&self, identity: KnownIdentity) -> Result<(), StoreError> {
        let mut guard = self.identities.write().map_err(|_| StoreError::Poisoned)?;
        if guard.iter().any(|known| known.name == identity.name) {
            return Err(StoreError::DuplicateName(identity.name));
        }
        guard.push(identity);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let mut guard = self.identities.write().map_err(|_| StoreError::Poisoned)?;
        let before = guard.len();
        guard.retain(|known| known.name != name);
        Ok(guard.len() != before)
    }
}
