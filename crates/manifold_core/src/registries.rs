use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::ids::{MediaTypeId, PrincipalId, RegistryId};

/// A node in the tenant hierarchy. Root registries are their own `root_parent_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registry {
    pub id: RegistryId,
    pub parent_id: Option<RegistryId>,
    pub root_parent_id: RegistryId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<PrincipalId>,
}

#[derive(Clone, Debug)]
pub struct NewRegistry {
    pub parent_id: Option<RegistryId>,
    pub name: String,
}

#[async_trait]
pub trait RegistryRepository: Send {
    async fn create_registry(&mut self, registry: &NewRegistry) -> Result<Registry>;

    async fn find_registry(&mut self, id: RegistryId) -> Result<Registry>;

    async fn find_registry_by_name(
        &mut self,
        parent_id: Option<RegistryId>,
        name: &str,
    ) -> Result<Registry>;
}

/// Interned media type strings shared by blobs, manifests and layers.
#[async_trait]
pub trait MediaTypeRepository: Send {
    /// Insert-or-find; always returns the id for `media_type`.
    async fn map_media_type(&mut self, media_type: &str) -> Result<MediaTypeId>;

    async fn media_type_exists(&mut self, media_type: &str) -> Result<bool>;

    async fn find_media_type(&mut self, id: MediaTypeId) -> Result<String>;
}
