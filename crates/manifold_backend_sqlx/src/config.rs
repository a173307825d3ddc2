use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

use super::errors::{Error, Result};
use super::metadata::MetadataPool;

/// Which database holds the metadata, selected by `type` in the config file.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Postgres(PostgresConfig),
    Sqlite(SqliteConfig),
}

impl DatabaseConfig {
    pub async fn new_metadata(&self) -> Result<MetadataPool> {
        match self {
            DatabaseConfig::Postgres(config) => config.new_metadata().await,
            DatabaseConfig::Sqlite(config) => config.new_metadata().await,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PostgresConfig {
    pub connection_string: String,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

impl PostgresConfig {
    pub async fn new_metadata(&self) -> Result<MetadataPool> {
        let mut options = PgPoolOptions::new();
        if let Some(max) = self.max_connections {
            options = options.max_connections(max);
        }
        let pool = options.connect(&self.connection_string).await?;
        Ok(MetadataPool::from_postgres(pool))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SqliteConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub busy_timeout_secs: Option<u64>,
}

impl SqliteConfig {
    const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;
    const MAX_CONNECTIONS: u32 = 4;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_secs: None,
        }
    }

    pub async fn new_metadata(&self) -> Result<MetadataPool> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::ConfigError(format!("{}: {e}", parent.display())))?;
            }
        }

        let busy_timeout = self
            .busy_timeout_secs
            .unwrap_or(Self::DEFAULT_BUSY_TIMEOUT_SECS);
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", self.path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            // writers outside the runner lock wait instead of failing with "database is locked"
            .busy_timeout(Duration::from_secs(busy_timeout));

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::MAX_CONNECTIONS)
            .connect_with(opts)
            .await?;
        Ok(MetadataPool::from_sqlite(pool))
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::postgres(
        "type: postgres\nconnection_string: postgres://manifold@localhost/manifold\nmax_connections: 8\n",
        true
    )]
    #[case::sqlite("type: sqlite\npath: /var/lib/manifold/metadata.db\n", false)]
    fn database_config_is_tagged_by_type(#[case] text: &str, #[case] postgres: bool) {
        let config: DatabaseConfig = serde_yaml::from_str(text).unwrap();
        assert_eq!(matches!(config, DatabaseConfig::Postgres(_)), postgres);
    }

    #[test]
    fn unknown_database_type_is_rejected() {
        let result = serde_yaml::from_str::<DatabaseConfig>("type: mysql\npath: db\n");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sqlite_pool_is_created_with_missing_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteConfig::new(dir.path().join("nested/metadata.db"));
        let pool = config.new_metadata().await.unwrap();
        assert!(pool.capabilities().serialized_writes);
        assert!(dir.path().join("nested/metadata.db").exists());
        pool.close().await;
    }
}
