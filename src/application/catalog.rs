//! Process-wide wiring: one codec, one resolution policy and one cache
//! coordinator shared by every repository built from the same settings.

use std::sync::Arc;

use crate::application::repos::QueryEngine;
use crate::application::repository::Repository;
use crate::application::resolver::{FieldResolver, ResolutionPolicy};
use crate::cache::{CacheCoordinator, CacheStore, InvalidationEvent, MemoryStore};
use crate::config::Settings;
use crate::domain::error::DomainError;
use crate::domain::opaque_id::OpaqueIdCodec;
use crate::domain::schema::SchemaRegistry;

#[derive(Clone)]
pub struct Catalog {
    schemas: SchemaRegistry,
    codec: Arc<OpaqueIdCodec>,
    policy: Arc<ResolutionPolicy>,
    cache: Option<Arc<CacheCoordinator>>,
}

impl Catalog {
    /// Wire everything from `settings`, caching in a [`MemoryStore`].
    pub fn from_settings(settings: &Settings) -> Result<Self, DomainError> {
        let store = Arc::new(MemoryStore::new(&settings.cache));
        Self::with_store(settings, store)
    }

    /// Like [`Catalog::from_settings`] with an explicit cache store.
    pub fn with_store(
        settings: &Settings,
        store: Arc<dyn CacheStore>,
    ) -> Result<Self, DomainError> {
        let codec = OpaqueIdCodec::new(&settings.codec)?;
        let cache = settings
            .cache
            .enabled
            .then(|| Arc::new(CacheCoordinator::new(settings.cache.clone(), store)));
        Ok(Self {
            schemas: settings.entities.clone(),
            codec: Arc::new(codec),
            policy: Arc::new(settings.resolution.clone()),
            cache,
        })
    }

    pub fn resolver(&self, entity: &str) -> Result<FieldResolver, DomainError> {
        Ok(FieldResolver::new(
            self.schemas.get(entity)?,
            Arc::clone(&self.codec),
            Arc::clone(&self.policy),
        ))
    }

    /// A repository with an empty criteria stack. Each call chain should own one.
    pub fn repository<E: QueryEngine>(
        &self,
        entity: &str,
        engine: Arc<E>,
    ) -> Result<Repository<E>, DomainError> {
        let repository = Repository::new(self.resolver(entity)?, engine);
        Ok(match &self.cache {
            Some(cache) => repository.with_cache(Arc::clone(cache)),
            None => repository,
        })
    }

    /// Route a write event to the shared cache. Returns the purged tags.
    pub fn on_write(&self, event: &InvalidationEvent) -> Vec<String> {
        match &self.cache {
            Some(cache) => cache.on_invalidation(event).into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn codec(&self) -> &OpaqueIdCodec {
        &self.codec
    }

    pub fn coordinator(&self) -> Option<&Arc<CacheCoordinator>> {
        self.cache.as_ref()
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }
}
