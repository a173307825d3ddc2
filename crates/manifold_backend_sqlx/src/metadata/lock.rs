use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::pool::Capabilities;
use super::tx::TxMode;

/// Process-wide transaction lock for one pool.
///
/// On backends that serialize writes, read-write transactions hold the exclusive side for their
/// whole lifetime and read-only transactions hold the shared side, so readers run together but
/// never overlap a writer. Elsewhere this is a no-op and row locks do the work.
#[derive(Clone, Debug)]
pub enum TxLock {
    Serialized(Arc<RwLock<()>>),
    Passthrough,
}

impl TxLock {
    pub fn for_capabilities(capabilities: Capabilities) -> Self {
        if capabilities.serialized_writes {
            TxLock::Serialized(Arc::new(RwLock::new(())))
        } else {
            TxLock::Passthrough
        }
    }

    pub(crate) async fn acquire(&self, mode: TxMode) -> TxGuard {
        match (self, mode) {
            (TxLock::Serialized(lock), TxMode::ReadWrite) => TxGuard {
                _exclusive: Some(lock.clone().write_owned().await),
                _shared: None,
            },
            (TxLock::Serialized(lock), TxMode::ReadOnly) => TxGuard {
                _exclusive: None,
                _shared: Some(lock.clone().read_owned().await),
            },
            (TxLock::Passthrough, _) => TxGuard {
                _exclusive: None,
                _shared: None,
            },
        }
    }
}

/// Released on drop.
pub(crate) struct TxGuard {
    _exclusive: Option<OwnedRwLockWriteGuard<()>>,
    _shared: Option<OwnedRwLockReadGuard<()>>,
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::metadata::pool::Backend;

    #[tokio::test]
    async fn writer_excludes_readers() {
        let lock = TxLock::for_capabilities(Backend::Sqlite.capabilities());
        let writer = lock.acquire(TxMode::ReadWrite).await;

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), lock.acquire(TxMode::ReadOnly)).await;
        assert!(blocked.is_err());

        drop(writer);
        let _r1 = lock.acquire(TxMode::ReadOnly).await;
        let _r2 = tokio::time::timeout(Duration::from_millis(50), lock.acquire(TxMode::ReadOnly))
            .await
            .expect("readers share the lock");
    }

    #[tokio::test]
    async fn passthrough_never_blocks() {
        let lock = TxLock::for_capabilities(Backend::Postgres.capabilities());
        let _w1 = lock.acquire(TxMode::ReadWrite).await;
        let _w2 = tokio::time::timeout(Duration::from_millis(50), lock.acquire(TxMode::ReadWrite))
            .await
            .expect("passthrough does not serialize");
    }
}
