use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP port
    pub port: u16,

    /// Root for task state and logs
    pub data_dir: PathBuf,

    /// Transfers allowed to run at once (at least 1)
    pub max_concurrency: usize,

    /// Task ids that may wait for a free slot
    pub queue_size: usize,

    /// Time between SIGINT and SIGKILL when stopping a transfer
    #[serde(with = "humantime_serde_compat")]
    pub stop_grace: Duration,

    /// rsync executable name or path
    pub rsync_binary: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9919,
            data_dir: dirs::data_local_dir()
                .map(|p| p.join("rsync-agent"))
                .unwrap_or_else(|| PathBuf::from("/var/lib/rsync-agent")),
            max_concurrency: 1,
            queue_size: 100,
            stop_grace: Duration::from_millis(200),
            rsync_binary: "rsync".to_string(),
        }
    }
}

impl Config {
    /// Defaults overridden by environment variables (a `.env` file is honored).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Config::default();

        if let Ok(port) = std::env::var("RSYNC_AGENT_PORT") {
            config.port = port.parse().context("RSYNC_AGENT_PORT")?;
        }

        if let Ok(dir) = std::env::var("RSYNC_AGENT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(n) = std::env::var("RSYNC_MAX_CONCURRENCY") {
            let n: i64 = n.parse().context("RSYNC_MAX_CONCURRENCY")?;
            config.max_concurrency = usize::try_from(n).unwrap_or(0);
        }

        if let Ok(n) = std::env::var("RSYNC_QUEUE_SIZE") {
            config.queue_size = n.parse().context("RSYNC_QUEUE_SIZE")?;
        }

        if let Ok(grace) = std::env::var("RSYNC_STOP_GRACE") {
            config.stop_grace = humantime::parse_duration(&grace).context("RSYNC_STOP_GRACE")?;
        }

        if let Ok(binary) = std::env::var("RSYNC_BINARY") {
            config.rsync_binary = binary;
        }

        if config.max_concurrency == 0 {
            config.max_concurrency = 1;
        }

        Ok(config)
    }

    pub fn storage_path(&self) -> PathBuf {
        self.data_dir.join("rsync").join("rsync_tasks.json")
    }

    pub fn log_root(&self) -> PathBuf {
        self.data_dir.join("rsync").join("logs")
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}

mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
