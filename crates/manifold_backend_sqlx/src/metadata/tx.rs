use std::time::Duration;

use sqlx::{pool::PoolConnection, Postgres, Sqlite, SqliteConnection, Transaction};

use manifold_core::PrincipalId;

use super::executor::Executor;
use super::lock::TxGuard;
use crate::errors::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

#[derive(Clone, Debug, Default)]
pub struct TxOptions {
    pub mode: TxMode,
    /// Stamped on `created_by`/`updated_by` of rows written through the transaction.
    pub principal: Option<PrincipalId>,
    /// Only honored by [`super::MetadataPool::with_tx`].
    pub timeout: Option<Duration>,
}

impl TxOptions {
    pub fn read_write() -> Self {
        Self::default()
    }

    pub fn read_only() -> Self {
        Self {
            mode: TxMode::ReadOnly,
            ..Default::default()
        }
    }

    pub fn principal(mut self, principal: PrincipalId) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub(crate) enum TxInner {
    Postgres(Transaction<'static, Postgres>),
    Sqlite(Transaction<'static, Sqlite>),
    SqliteWrite(SqliteWriteTx),
}

/// A SQLite write transaction opened with `BEGIN IMMEDIATE`.
///
/// It holds the database write lock from its first statement instead of upgrading a read
/// snapshot later, so a write committed elsewhere in the meantime cannot make it fail with
/// `SQLITE_BUSY_SNAPSHOT`. Dropped while still open, the connection is detached from the pool
/// and closed, which rolls back.
pub(crate) struct SqliteWriteTx {
    conn: Option<PoolConnection<Sqlite>>,
}

impl SqliteWriteTx {
    pub(crate) async fn begin(conn: PoolConnection<Sqlite>) -> Result<Self> {
        let mut tx = Self { conn: Some(conn) };
        sqlx::query("BEGIN IMMEDIATE").execute(tx.conn()?).await?;
        Ok(tx)
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn.as_deref_mut().ok_or(Error::MetadataTxInactive)
    }

    async fn finish(&mut self, statement: &'static str) -> Result<()> {
        sqlx::query(statement).execute(self.conn()?).await?;
        // back to the pool
        drop(self.conn.take());
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for SqliteWriteTx {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!("closing sqlite connection left inside a write transaction");
            drop(conn.detach());
        }
    }
}

/// An open transaction. Dropping it without [`MetadataTx::commit`] rolls it back.
pub struct MetadataTx {
    // dropped before the guard so the lock outlives the transaction
    tx: Option<TxInner>,
    _guard: TxGuard,
    principal: Option<PrincipalId>,
}

impl MetadataTx {
    pub(crate) fn new(tx: TxInner, guard: TxGuard, principal: Option<PrincipalId>) -> Self {
        Self {
            tx: Some(tx),
            _guard: guard,
            principal,
        }
    }

    pub(crate) fn executor(&mut self) -> Result<Executor<'_>> {
        match self.tx.as_mut().ok_or(Error::MetadataTxInactive)? {
            TxInner::Postgres(tx) => Ok(Executor::Postgres(&mut **tx)),
            TxInner::Sqlite(tx) => Ok(Executor::Sqlite(&mut **tx)),
            TxInner::SqliteWrite(tx) => Ok(Executor::Sqlite(tx.conn()?)),
        }
    }

    pub fn principal(&self) -> Option<PrincipalId> {
        self.principal
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    pub async fn commit(mut self) -> Result<()> {
        match self.tx.take() {
            Some(TxInner::Postgres(tx)) => Ok(tx.commit().await?),
            Some(TxInner::Sqlite(tx)) => Ok(tx.commit().await?),
            Some(TxInner::SqliteWrite(tx)) => tx.commit().await,
            None => Err(Error::MetadataTxInactive),
        }
    }

    pub async fn rollback(mut self) -> Result<()> {
        match self.tx.take() {
            Some(TxInner::Postgres(tx)) => Ok(tx.rollback().await?),
            Some(TxInner::Sqlite(tx)) => Ok(tx.rollback().await?),
            Some(TxInner::SqliteWrite(tx)) => tx.rollback().await,
            None => Err(Error::MetadataTxInactive),
        }
    }
}

pub(crate) enum ConnInner {
    Postgres(PoolConnection<Postgres>),
    Sqlite(PoolConnection<Sqlite>),
}

/// A pooled connection usable outside of a transaction.
pub struct MetadataConn {
    conn: ConnInner,
    principal: Option<PrincipalId>,
}

impl MetadataConn {
    pub(crate) fn new(conn: ConnInner, principal: Option<PrincipalId>) -> Self {
        Self { conn, principal }
    }

    pub(crate) fn executor(&mut self) -> Result<Executor<'_>> {
        match &mut self.conn {
            ConnInner::Postgres(conn) => Ok(Executor::Postgres(&mut **conn)),
            ConnInner::Sqlite(conn) => Ok(Executor::Sqlite(&mut **conn)),
        }
    }

    pub fn principal(&self) -> Option<PrincipalId> {
        self.principal
    }
}
