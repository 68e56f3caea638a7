//! Entity store contract
//!
//! Generic CRUD over pipelines, stages and deals. The engine never assumes
//! where entities live; [`InMemoryStore`] is the bundled implementation.

use crate::deal::Deal;
use crate::ids::{DealId, PipelineId, StageId};
use crate::pipeline::{Pipeline, Stage};
use async_trait::async_trait;
use dealflow_ledger::EntityType;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Something an [`EntityStore`] can hold
pub trait Entity: Clone + Debug + Send + Sync + 'static {
    /// Identifier type
    type Id: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static;

    /// Ledger tag for this kind of entity
    const ENTITY_TYPE: EntityType;

    /// This entity's identifier
    fn id(&self) -> Self::Id;
}

impl Entity for Deal {
    type Id = DealId;
    const ENTITY_TYPE: EntityType = EntityType::DEAL;

    fn id(&self) -> DealId {
        self.id
    }
}

impl Entity for Pipeline {
    type Id = PipelineId;
    const ENTITY_TYPE: EntityType = EntityType::PIPELINE;

    fn id(&self) -> PipelineId {
        self.id
    }
}

impl Entity for Stage {
    type Id = StageId;
    const ENTITY_TYPE: EntityType = EntityType::STAGE;

    fn id(&self) -> StageId {
        self.id
    }
}

/// Entity store failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No entity with that id
    #[error("{entity_type} {id} not found")]
    NotFound {
        /// Entity kind
        entity_type: EntityType,
        /// Requested id
        id: String,
    },

    /// Create with an id already in use
    #[error("{entity_type} {id} already exists")]
    AlreadyExists {
        /// Entity kind
        entity_type: EntityType,
        /// Conflicting id
        id: String,
    },

    /// Backend could not serve the request
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Not-found error for an entity kind
    #[must_use]
    pub fn not_found<T: Entity>(id: T::Id) -> Self {
        Self::NotFound {
            entity_type: T::ENTITY_TYPE,
            id: id.to_string(),
        }
    }

    /// Whether the entity was missing
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the caller may reasonably retry
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Generic CRUD contract
#[async_trait]
pub trait EntityStore<T: Entity>: Debug + Send + Sync {
    /// Entity by id
    async fn get(&self, id: T::Id) -> Result<Option<T>, StoreError>;

    /// Insert a new entity
    ///
    /// # Errors
    /// Returns [`StoreError::AlreadyExists`] if the id is taken
    async fn create(&self, entity: T) -> Result<T, StoreError>;

    /// Replace an existing entity
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the id is unknown
    async fn update(&self, entity: T) -> Result<T, StoreError>;

    /// Remove by id; `Ok(None)` if nothing was stored under it
    async fn remove(&self, id: T::Id) -> Result<Option<T>, StoreError>;

    /// All entities passing `filter`, in insertion order
    async fn list(
        &self,
        filter: &(dyn for<'x> Fn(&'x T) -> bool + Send + Sync),
    ) -> Result<Vec<T>, StoreError>;
}

/// Insertion-ordered in-memory store
#[derive(Debug)]
pub struct InMemoryStore<T: Entity> {
    items: RwLock<IndexMap<T::Id, T>>,
}

impl<T: Entity> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> InMemoryStore<T> {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: RwLock::new(IndexMap::new()),
        }
    }

    /// Number of stored entities
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Nothing stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

#[async_trait]
impl<T: Entity> EntityStore<T> for InMemoryStore<T> {
    async fn get(&self, id: T::Id) -> Result<Option<T>, StoreError> {
        Ok(self.items.read().get(&id).cloned())
    }

    async fn create(&self, entity: T) -> Result<T, StoreError> {
        let mut items = self.items.write();
        let id = entity.id();
        if items.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                entity_type: T::ENTITY_TYPE,
                id: id.to_string(),
            });
        }
        items.insert(id, entity.clone());
        Ok(entity)
    }

    async fn update(&self, entity: T) -> Result<T, StoreError> {
        let mut items = self.items.write();
        match items.get_mut(&entity.id()) {
            Some(slot) => {
                *slot = entity.clone();
                Ok(entity)
            }
            None => Err(StoreError::not_found::<T>(entity.id())),
        }
    }

    async fn remove(&self, id: T::Id) -> Result<Option<T>, StoreError> {
        Ok(self.items.write().shift_remove(&id))
    }

    async fn list(
        &self,
        filter: &(dyn for<'x> Fn(&'x T) -> bool + Send + Sync),
    ) -> Result<Vec<T>, StoreError> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|item| filter(item))
            .cloned()
            .collect())
    }
}
