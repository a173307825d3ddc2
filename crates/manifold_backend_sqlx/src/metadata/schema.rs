use chrono::{DateTime, TimeZone, Utc};
use sea_query::{Alias, Iden};

use crate::errors::{Error, Result};

// Column tables for every entity. Each enum is the single place a table's columns are named.

#[derive(Iden)]
pub(crate) enum Registries {
    Table,
    Id,
    ParentId,
    RootParentId,
    Name,
    CreatedAt,
    CreatedBy,
}

#[derive(Iden)]
pub(crate) enum MediaTypes {
    Table,
    Id,
    MediaType,
    CreatedAt,
}

#[derive(Iden)]
pub(crate) enum Blobs {
    Table,
    Id,
    RootParentId,
    Digest,
    MediaTypeId,
    Size,
    CreatedAt,
    CreatedBy,
}

#[derive(Iden)]
pub(crate) enum RegistryBlobs {
    Table,
    RegistryId,
    BlobId,
    ImageName,
    CreatedAt,
    CreatedBy,
}

#[derive(Iden)]
pub(crate) enum Manifests {
    Table,
    Id,
    RegistryId,
    ImageName,
    Digest,
    SchemaVersion,
    MediaTypeId,
    ArtifactMediaType,
    TotalSize,
    Payload,
    ConfigBlobId,
    ConfigMediaType,
    ConfigDigest,
    ConfigPayload,
    SubjectId,
    SubjectDigest,
    NonConformant,
    NonDistributableLayers,
    Annotations,
    CreatedAt,
    UpdatedAt,
    CreatedBy,
    UpdatedBy,
}

#[derive(Iden)]
pub(crate) enum ManifestReferences {
    Table,
    Id,
    RegistryId,
    ParentId,
    ChildId,
    CreatedAt,
    CreatedBy,
}

#[derive(Iden)]
pub(crate) enum OciImageIndexMappings {
    Table,
    Id,
    ParentManifestId,
    ChildDigest,
    CreatedAt,
    CreatedBy,
}

#[derive(Iden)]
pub(crate) enum Layers {
    Table,
    Id,
    RegistryId,
    ManifestId,
    MediaTypeId,
    BlobId,
    Size,
    CreatedAt,
    CreatedBy,
}

#[derive(Iden)]
pub(crate) enum Tags {
    Table,
    Id,
    Name,
    ImageName,
    RegistryId,
    ManifestId,
    CreatedAt,
    UpdatedAt,
    CreatedBy,
    UpdatedBy,
}

#[derive(Iden, Clone, Copy)]
pub(crate) enum QuarantineArtifacts {
    Table,
    Id,
    NodeId,
    Reason,
    RegistryId,
    ImageId,
    ArtifactId,
    CreatedAt,
    CreatedBy,
}

#[derive(Iden)]
pub(crate) enum Tasks {
    Table,
    Key,
    Kind,
    Payload,
    Status,
    RunAgain,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
pub(crate) enum TaskSources {
    Table,
    Key,
    SourceType,
    SourceId,
    Status,
    RunId,
    Error,
    UpdatedAt,
}

#[derive(Iden)]
pub(crate) enum TaskEvents {
    Table,
    Id,
    Key,
    Event,
    Payload,
    CreatedAt,
}

/// The row proposed for insertion inside an `ON CONFLICT DO UPDATE` clause.
pub(crate) fn excluded() -> Alias {
    Alias::new("excluded")
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(Error::InvalidTimestamp(ms))
}
