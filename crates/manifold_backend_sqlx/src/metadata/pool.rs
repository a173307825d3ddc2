use futures::future::BoxFuture;
use sqlx::{postgres::PgPool, sqlite::SqlitePool};

use manifold_core::PrincipalId;

use super::lock::TxLock;
use super::tx::{ConnInner, MetadataConn, MetadataTx, SqliteWriteTx, TxInner, TxMode, TxOptions};
use crate::errors::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

/// What the storage engine can do on its own. Callers branch on these flags, never on the
/// engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// `SELECT ... FOR UPDATE` takes a real row lock.
    pub row_locks: bool,
    /// Only one writer at a time; the runner must serialize write transactions itself.
    pub serialized_writes: bool,
    /// Transactions can be declared read-only.
    pub read_only_transactions: bool,
}

impl Backend {
    pub fn capabilities(self) -> Capabilities {
        match self {
            Backend::Postgres => Capabilities {
                row_locks: true,
                serialized_writes: false,
                read_only_transactions: true,
            },
            Backend::Sqlite => Capabilities {
                row_locks: false,
                serialized_writes: true,
                read_only_transactions: false,
            },
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum PoolInner {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

/// Connection pool plus the one [`TxLock`] shared by every transaction begun from it.
#[derive(Clone, Debug)]
pub struct MetadataPool {
    pool: PoolInner,
    lock: TxLock,
}

impl MetadataPool {
    pub(crate) fn new(pool: PoolInner) -> Self {
        let backend = match &pool {
            PoolInner::Postgres(_) => Backend::Postgres,
            PoolInner::Sqlite(_) => Backend::Sqlite,
        };
        Self {
            pool,
            lock: TxLock::for_capabilities(backend.capabilities()),
        }
    }

    pub fn from_postgres(pool: PgPool) -> Self {
        Self::new(PoolInner::Postgres(pool))
    }

    pub fn from_sqlite(pool: SqlitePool) -> Self {
        Self::new(PoolInner::Sqlite(pool))
    }

    pub fn backend(&self) -> Backend {
        match self.pool {
            PoolInner::Postgres(_) => Backend::Postgres,
            PoolInner::Sqlite(_) => Backend::Sqlite,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend().capabilities()
    }

    pub async fn migrate(&self) -> Result<()> {
        match &self.pool {
            PoolInner::Postgres(pool) => sqlx::migrate!("./migrations/postgres").run(pool).await?,
            PoolInner::Sqlite(pool) => sqlx::migrate!("./migrations/sqlite").run(pool).await?,
        }
        tracing::info!(backend = ?self.backend(), "metadata schema up to date");
        Ok(())
    }

    /// Accessor outside of any transaction. Each statement commits on its own.
    pub async fn conn(&self, principal: Option<PrincipalId>) -> Result<MetadataConn> {
        let conn = match &self.pool {
            PoolInner::Postgres(pool) => ConnInner::Postgres(pool.acquire().await?),
            PoolInner::Sqlite(pool) => ConnInner::Sqlite(pool.acquire().await?),
        };
        Ok(MetadataConn::new(conn, principal))
    }

    /// Begin a transaction after taking the lock tier matching `opts.mode`.
    pub async fn begin(&self, opts: TxOptions) -> Result<MetadataTx> {
        let guard = self.lock.acquire(opts.mode).await;
        let tx = match &self.pool {
            PoolInner::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                if opts.mode == TxMode::ReadOnly && self.capabilities().read_only_transactions {
                    sqlx::query("SET TRANSACTION READ ONLY")
                        .execute(&mut *tx)
                        .await?;
                }
                TxInner::Postgres(tx)
            }
            PoolInner::Sqlite(pool) => match opts.mode {
                TxMode::ReadWrite => {
                    TxInner::SqliteWrite(SqliteWriteTx::begin(pool.acquire().await?).await?)
                }
                TxMode::ReadOnly => TxInner::Sqlite(pool.begin().await?),
            },
        };
        Ok(MetadataTx::new(tx, guard, opts.principal))
    }

    /// Run `f` in a transaction: commit when it returns `Ok`, roll back otherwise.
    ///
    /// When `opts.timeout` elapses first, the work is dropped, the transaction is rolled back,
    /// and [`manifold_core::Error::DeadlineExceeded`] is returned. A rollback failure is logged
    /// and the error that caused the rollback is returned.
    ///
    /// The closure must not begin another read-write transaction on the same pool.
    pub async fn with_tx<T, E, F>(&self, opts: TxOptions, f: F) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut MetadataTx) -> BoxFuture<'t, std::result::Result<T, E>> + Send,
        E: From<Error> + Send,
        T: Send,
    {
        let timeout = opts.timeout;
        let mut tx = self.begin(opts).await?;

        let outcome = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, f(&mut tx)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::from(manifold_core::Error::DeadlineExceeded).into()),
            },
            None => f(&mut tx).await,
        };

        match outcome {
            Ok(v) => {
                tx.commit().await?;
                Ok(v)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("failed to roll back transaction: {rollback_err}");
                }
                Err(e)
            }
        }
    }

    pub async fn close(&self) {
        match &self.pool {
            PoolInner::Postgres(pool) => pool.close().await,
            PoolInner::Sqlite(pool) => pool.close().await,
        }
    }
}
