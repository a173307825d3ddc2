mod config;
mod errors;
mod manifests;
pub mod metadata;
mod scheduler;
mod worker;

pub use config::{DatabaseConfig, PostgresConfig, SqliteConfig};
pub use errors::{Error, Result};
pub use manifests::{ManifestWriter, PushedManifest};
pub use scheduler::{Scheduled, TaskScheduler};
pub use worker::{ClaimedTask, HandlerError, TaskHandler, TaskWorker, WorkerConfig};
