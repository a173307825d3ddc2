//! Metadata storage over sqlx.
//!
//! Queries are written once against an [`executor::Executor`] and shared by [`MetadataTx`] and
//! [`MetadataConn`], which both implement every repository trait from [`manifold_core`].
mod executor;
mod lock;
mod pool;
mod schema;
mod tx;

mod blobs;
mod layers;
mod manifests;
mod quarantine;
mod references;
mod registries;
mod tags;
mod tasks;

pub use lock::TxLock;
pub use pool::{Backend, Capabilities, MetadataPool};
pub use tx::{MetadataConn, MetadataTx, TxMode, TxOptions};
