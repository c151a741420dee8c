//! Entity catalog lookup.
//!
//! The catalog owns entity identity; this crate only asks whether a
//! reference exists before activating a relationship that names it.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use entity_history_types::EntityId;

/// Read access to the external entity catalog.
pub trait EntityCatalog: Send + Sync + core::fmt::Debug {
    /// Whether `entity` names a known entity.
    fn contains(&self, entity: EntityId) -> bool;
}

/// A catalog backed by an in-memory set of references.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entities: RwLock<BTreeSet<EntityId>>,
}

impl InMemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `entity` to the catalog.
    pub fn register(&self, entity: EntityId) {
        self.entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity);
    }

    /// Remove `entity` from the catalog.
    pub fn forget(&self, entity: EntityId) {
        self.entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entity);
    }
}

impl FromIterator<EntityId> for InMemoryCatalog {
    fn from_iter<I: IntoIterator<Item = EntityId>>(iter: I) -> Self {
        Self {
            entities: RwLock::new(iter.into_iter().collect()),
        }
    }
}

impl EntityCatalog for InMemoryCatalog {
    fn contains(&self, entity: EntityId) -> bool {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&entity)
    }
}
