use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::ids::{ArtifactId, ImageId, NodeId, PrincipalId, QuarantineId, RegistryId};

/// A hold on an image, an artifact version, or one file of it. A `None` level on a stored hold
/// covers everything below it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuarantineArtifact {
    pub id: QuarantineId,
    pub node_id: Option<NodeId>,
    pub reason: String,
    pub registry_id: RegistryId,
    pub image_id: Option<ImageId>,
    pub artifact_id: Option<ArtifactId>,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<PrincipalId>,
}

/// The key a hold is created, looked up, and deleted by.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuarantineScope {
    pub registry_id: RegistryId,
    pub image_id: Option<ImageId>,
    pub artifact_id: Option<ArtifactId>,
    pub node_id: Option<NodeId>,
}

impl QuarantineScope {
    pub fn image(registry_id: RegistryId, image_id: ImageId) -> Self {
        Self {
            registry_id,
            image_id: Some(image_id),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, artifact_id: ArtifactId) -> Self {
        self.artifact_id = Some(artifact_id);
        self
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

#[async_trait]
pub trait QuarantineRepository: Send {
    async fn create_quarantine(
        &mut self,
        scope: &QuarantineScope,
        reason: &str,
    ) -> Result<QuarantineArtifact>;

    /// The most specific hold covering `scope`, or `None` when access is not held.
    async fn find_quarantine(
        &mut self,
        scope: &QuarantineScope,
    ) -> Result<Option<QuarantineArtifact>>;

    /// Deletes only holds created with exactly this scope.
    async fn delete_quarantine(&mut self, scope: &QuarantineScope) -> Result<bool>;

    /// One flag per requested image, in request order.
    async fn quarantine_status_for_images(
        &mut self,
        registry_id: RegistryId,
        image_ids: &[ImageId],
    ) -> Result<Vec<bool>>;
}
