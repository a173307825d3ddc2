use std::time::Duration;

use serde::Deserialize;

use manifold_backend_sqlx::{DatabaseConfig, WorkerConfig};

#[derive(Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: Option<WorkerSettings>,
}

#[derive(Clone, Default, Deserialize)]
pub struct WorkerSettings {
    pub poll_interval_ms: Option<u64>,
    pub batch_size: Option<u32>,
}

impl Config {
    pub fn worker_config(&self) -> WorkerConfig {
        let defaults = WorkerConfig::default();
        let settings = self.worker.clone().unwrap_or_default();
        WorkerConfig {
            poll_interval: settings
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            batch_size: settings.batch_size.unwrap_or(defaults.batch_size),
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::defaults("database:\n  type: sqlite\n  path: ./manifold.db\n", 1000, 16)]
    #[case::partial(
        "database:\n  type: sqlite\n  path: ./manifold.db\nworker:\n  batch_size: 4\n",
        1000,
        4
    )]
    #[case::full(
        "database:\n  type: postgres\n  connection_string: postgres://localhost/manifold\nworker:\n  poll_interval_ms: 250\n  batch_size: 32\n",
        250,
        32
    )]
    fn worker_settings_fall_back_to_defaults(
        #[case] text: &str,
        #[case] poll_interval_ms: u64,
        #[case] batch_size: u32,
    ) {
        let config: Config = serde_yaml::from_str(text).unwrap();
        let worker = config.worker_config();
        assert_eq!(worker.poll_interval, Duration::from_millis(poll_interval_ms));
        assert_eq!(worker.batch_size, batch_size);
    }
}
