use sqlx::error::ErrorKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("manifold error: {0}")]
    ManifoldError(#[from] manifold_core::Error),

    #[error("sqlx error: {0}")]
    SQLXError(#[from] sqlx::Error),
    #[error("sqlx migration error: {0}")]
    SQLXMigrateError(#[from] sqlx::migrate::MigrateError),
    #[error("sea-query error: {0}")]
    SeaQueryError(#[from] sea_query::error::Error),

    #[error("error serializing to value: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("invalid timestamp in column: {0}")]
    InvalidTimestamp(i64),

    #[error("configuration error: {0}")]
    ConfigError(String),

    // metadata errors
    #[error("MetadataTx already rolled back or committed")]
    MetadataTxInactive,
}

impl Error {
    fn database_error_kind(&self) -> Option<ErrorKind> {
        match self {
            Error::SQLXError(sqlx::Error::Database(dberr)) => Some(dberr.kind()),
            _ => None,
        }
    }

    pub(crate) fn is_foreign_key_violation(&self) -> bool {
        matches!(
            self.database_error_kind(),
            Some(ErrorKind::ForeignKeyViolation)
        )
    }

    pub(crate) fn is_unique_violation(&self) -> bool {
        matches!(self.database_error_kind(), Some(ErrorKind::UniqueViolation))
    }
}

impl From<Error> for manifold_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::ManifoldError(e) => e,
            Error::MetadataTxInactive => manifold_core::Error::TransactionInactive,
            e => manifold_core::Error::BackendError(Box::new(e)),
        }
    }
}
