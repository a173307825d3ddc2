use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::ids::{ManifestId, PrincipalId, RegistryId, TagId};

/// A mutable name pointing at one manifest of an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub image_name: String,
    pub registry_id: RegistryId,
    pub manifest_id: ManifestId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<PrincipalId>,
    pub updated_by: Option<PrincipalId>,
}

#[derive(Clone, Debug)]
pub struct NewTag {
    pub registry_id: RegistryId,
    pub image_name: String,
    pub name: String,
    pub manifest_id: ManifestId,
}

/// Marker pagination as used by the distribution tag list endpoint: tags strictly after `last`
/// in lexicographic order, at most `limit` of them.
#[derive(Clone, Debug)]
pub struct TagPage {
    pub last: Option<String>,
    pub limit: u32,
}

impl TagPage {
    pub fn first(limit: u32) -> Self {
        Self { last: None, limit }
    }

    pub fn after(last: impl Into<String>, limit: u32) -> Self {
        Self {
            last: Some(last.into()),
            limit,
        }
    }
}

#[async_trait]
pub trait TagRepository: Send {
    /// Upsert keyed by registry, name and image. Returns true when a row was written and false
    /// when the tag already pointed at `tag.manifest_id`, in which case nothing is touched.
    async fn create_or_update_tag(&mut self, tag: &NewTag) -> Result<bool>;

    /// Row-lock at most one tag with this name ahead of a mutation. Returns whether one exists.
    /// Without row locks this is only an existence check.
    async fn lock_tag_by_name_for_update(
        &mut self,
        registry_id: RegistryId,
        name: &str,
    ) -> Result<bool>;

    /// Move a tag only if it still points at `expected`; otherwise
    /// [`crate::Error::VersionConflict`].
    async fn compare_and_swap_tag(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
        name: &str,
        expected: ManifestId,
        manifest_id: ManifestId,
    ) -> Result<()>;

    async fn find_tag(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
        name: &str,
    ) -> Result<Tag>;

    async fn get_tags_by_manifest_id(&mut self, manifest_id: ManifestId) -> Result<Vec<String>>;

    async fn tags_paginated(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
        page: &TagPage,
    ) -> Result<Vec<Tag>>;

    async fn has_tags_after(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
        last: &str,
    ) -> Result<bool>;

    async fn delete_tag(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
        name: &str,
    ) -> Result<bool>;

    async fn delete_tag_by_name(&mut self, registry_id: RegistryId, name: &str) -> Result<bool>;

    async fn delete_tag_by_manifest_id(
        &mut self,
        registry_id: RegistryId,
        manifest_id: ManifestId,
    ) -> Result<bool>;

    async fn delete_tags_by_image_name(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
    ) -> Result<bool>;
}
