use crate::ids::ManifestId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    Duplicate(&'static str),

    #[error("referenced manifest not found")]
    ReferencedManifestNotFound,
    #[error("manifest {0} cannot reference itself")]
    ManifestSelfReference(ManifestId),
    #[error("blob unknown: {0}")]
    BlobUnknown(String),
    #[error("content referenced elsewhere")]
    ContentReferenced,

    #[error("version conflict on {0}, re-read and retry")]
    VersionConflict(&'static str),

    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("transaction already committed or rolled back")]
    TransactionInactive,

    #[error("backend error: {0}")]
    BackendError(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// True when no row matched a unique lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
