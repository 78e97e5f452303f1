use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [stream]
//                    outbound_queue_capacity = 512
//
//   env var:         REPLY_HUB_STREAM__OUTBOUND_QUEUE_CAPACITY=512
//
//   (double underscore = nesting, single underscore stays within field names)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub stream: StreamFileConfig,
    #[serde(default)]
    pub generation: GenerationFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerFileConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

/// Streaming core tunables (lives under `[stream]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamFileConfig {
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
}

impl Default for StreamFileConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: default_outbound_queue_capacity(),
            generation_timeout_secs: default_generation_timeout_secs(),
        }
    }
}

/// Generation backend (lives under `[generation]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationFileConfig {
    #[serde(default = "default_generation_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for GenerationFileConfig {
    fn default() -> Self {
        Self {
            endpoint: default_generation_endpoint(),
            model: default_generation_model(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_outbound_queue_capacity() -> usize {
    256
}
fn default_generation_timeout_secs() -> u64 {
    300
}
fn default_generation_endpoint() -> String {
    "http://127.0.0.1:11434/api/chat".to_string()
}
fn default_generation_model() -> String {
    "llama3.2".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults → config.toml → REPLY_HUB_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `REPLY_HUB_SERVER__PORT=9000`  →  `server.port = 9000`
///   `REPLY_HUB_GENERATION__MODEL=qwen2.5`  →  `generation.model = "qwen2.5"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("REPLY_HUB_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Streaming core configuration (runtime view).
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue. A full queue evicts the
    /// connection.
    pub outbound_queue_capacity: usize,
    /// Deadline for one whole generation call (None = disabled)
    pub generation_timeout: Option<Duration>,
}

impl HubConfig {
    pub fn from_file(fc: &StreamFileConfig) -> Self {
        Self {
            outbound_queue_capacity: fc.outbound_queue_capacity.max(1),
            generation_timeout: if fc.generation_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.generation_timeout_secs))
            },
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_file(&StreamFileConfig::default())
    }
}

/// Generation backend configuration (runtime view).
#[derive(Clone, Debug)]
pub struct GenerationConfig {
    pub endpoint: String,
    pub model: String,
    pub connect_timeout: Duration,
}

impl GenerationConfig {
    pub fn from_file(fc: &GenerationFileConfig) -> Self {
        Self {
            endpoint: fc.endpoint.clone(),
            model: fc.model.clone(),
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs),
        }
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct DataDirConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl DataDirConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".reply_hub"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("reply_hub.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn reset_database(&self) -> Result<()> {
        if self.db_path.exists() {
            std::fs::remove_file(&self.db_path)
                .with_context(|| format!("Failed to delete database: {:?}", self.db_path))?;
            info!("Database reset: {:?}", self.db_path);

            for ext in ["db-wal", "db-shm"] {
                let sidecar = self.db_path.with_extension(ext);
                if sidecar.exists() {
                    std::fs::remove_file(&sidecar)
                        .with_context(|| format!("Failed to delete {:?}", sidecar))?;
                }
            }
        }
        Ok(())
    }
}
