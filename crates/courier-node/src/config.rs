use std::path::{Path, PathBuf};

use courier_notify::NotifyConfig;
use courier_realtime::RealtimeConfig;
use serde::{Deserialize, Serialize};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Node configuration, loaded from TOML or JSON and overridden by CLI flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `host:port` of the JSON-lines feed.
    pub feed_addr: String,
    /// Directory for markers and preferences. Instances sharing it dedup
    /// against each other.
    pub state_dir: PathBuf,
    /// Shared cipher secret. Prefer the `COURIER_SECRET` environment variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Signed-in user id, used to title own messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub log_format: LogFormat,
    /// Per-stream buffer of the TCP feed.
    pub feed_buffer: usize,
    pub realtime: RealtimeConfig,
    pub notify: NotifyConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            feed_addr: "127.0.0.1:7400".to_string(),
            state_dir: PathBuf::from(".courier"),
            secret: None,
            identity: None,
            log_format: LogFormat::Text,
            feed_buffer: 256,
            realtime: RealtimeConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Loads `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            Some(p) => {
                tracing::warn!("Config file not found, using defaults: {}", p.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn markers_dir(&self) -> PathBuf {
        self.state_dir.join("markers")
    }
}
