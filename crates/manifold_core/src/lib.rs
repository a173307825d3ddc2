//! # Registry Metadata Abstractions
//!
//! Domain types and repository traits for the metadata and coordination layer of a multi-tenant
//! artifact registry. Nothing in this crate touches a database; backend crates implement the
//! repository traits over whatever storage they like.
//!
//! The entities tracked here are:
//!
//! * content-addressed [`blobs`] deduplicated per tenant tree
//! * [`manifests`], the reference graph between indexes and their children, and layer links
//! * mutable [`tags`] pointing at manifests
//! * [`quarantine`] holds on artifacts and files
//! * durable [`tasks`] with per-trigger sources and an append-only event trail
//!
//! Every repository method takes `&mut self`; implementations are expected to be thin accessors
//! over either a transaction or a plain connection so that the same trait can be used inside and
//! outside transactional scopes.
pub mod blobs;
pub mod errors;
pub use errors::{Error, Result};

mod ids;
pub use ids::{
    ArtifactId, BlobId, ImageId, IndexMappingId, LayerId, ManifestId, ManifestReferenceId,
    MediaTypeId, NodeId, PrincipalId, QuarantineId, RegistryId, TagId, TaskEventId,
};

pub mod manifest_spec;
pub use manifest_spec::{validate_tag_name, DescriptorInfo, ManifestRef, ManifestSpec};

pub mod manifests;

mod oci_digest;
pub use oci_digest::{DigestAlgorithm, OciDigest};

mod outcome;
pub use outcome::CreateOrFind;

pub mod quarantine;
pub mod registries;
pub mod tags;
pub mod tasks;
