use anyhow::{Context, Result};
use relay_supervisor::{RelayConfig, SupervisorSettings};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::ws::GatewaySettings;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [supervisor]
//                    autostart = true
//
//   env var:         RADIO_SUPERVISOR__AUTOSTART=true   (double underscore = nesting)
//
//   (single underscore stays within field names: RADIO_GATEWAY__PONG_TIMEOUT_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub gateway: GatewayFileConfig,
    #[serde(default)]
    pub supervisor: SupervisorFileConfig,
    /// Initial encoder settings. A persisted `state/relay.toml` wins over these.
    #[serde(default)]
    pub encoder: RelayConfig,
}

/// Listener address (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Realtime gateway tunables (lives under `[gateway]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayFileConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_presence_debounce_ms")]
    pub presence_debounce_ms: u64,
    #[serde(default = "default_history_retention_secs")]
    pub history_retention_secs: u64,
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
    /// Outbound queue length per connection
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
}

impl Default for GatewayFileConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            presence_debounce_ms: default_presence_debounce_ms(),
            history_retention_secs: default_history_retention_secs(),
            max_history_messages: default_max_history_messages(),
            send_queue: default_send_queue(),
        }
    }
}

impl GatewayFileConfig {
    pub fn to_settings(&self) -> GatewaySettings {
        GatewaySettings {
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            presence_debounce: Duration::from_millis(self.presence_debounce_ms),
            history_retention: Duration::from_secs(self.history_retention_secs),
            max_history_messages: self.max_history_messages,
            send_queue: self.send_queue.max(1),
        }
    }
}

/// Encoder supervision tunables (lives under `[supervisor]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisorFileConfig {
    /// Issue a start as soon as the server is up
    #[serde(default)]
    pub autostart: bool,
    /// Container whose running state gates encoder spawns. Unset: always ready.
    #[serde(default)]
    pub relay_container: Option<String>,
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_spawn_timeout_secs")]
    pub spawn_timeout_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_dependency_recheck_secs")]
    pub dependency_recheck_secs: u64,
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

impl Default for SupervisorFileConfig {
    fn default() -> Self {
        Self {
            autostart: false,
            relay_container: None,
            restart_delay_secs: default_restart_delay_secs(),
            max_restart_attempts: default_max_restart_attempts(),
            spawn_timeout_secs: default_spawn_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            dependency_recheck_secs: default_dependency_recheck_secs(),
            stable_after_secs: default_stable_after_secs(),
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

impl SupervisorFileConfig {
    pub fn to_settings(&self, config_path: PathBuf) -> SupervisorSettings {
        SupervisorSettings {
            restart_delay: Duration::from_secs(self.restart_delay_secs),
            max_restart_attempts: self.max_restart_attempts,
            spawn_timeout: Duration::from_secs(self.spawn_timeout_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            dependency_recheck: Duration::from_secs(self.dependency_recheck_secs.max(1)),
            stable_after: Duration::from_secs(self.stable_after_secs),
            health_interval: Duration::from_secs(self.health_interval_secs.max(1)),
            config_path: Some(config_path),
        }
    }
}

fn default_ping_interval_secs() -> u64 {
    10
}
fn default_pong_timeout_secs() -> u64 {
    30
}
fn default_presence_debounce_ms() -> u64 {
    100
}
fn default_history_retention_secs() -> u64 {
    3600
}
fn default_max_history_messages() -> usize {
    500
}
fn default_send_queue() -> usize {
    1024
}
fn default_restart_delay_secs() -> u64 {
    5
}
fn default_max_restart_attempts() -> u32 {
    5
}
fn default_spawn_timeout_secs() -> u64 {
    10
}
fn default_stop_grace_secs() -> u64 {
    5
}
fn default_dependency_recheck_secs() -> u64 {
    10
}
fn default_stable_after_secs() -> u64 {
    30
}
fn default_health_interval_secs() -> u64 {
    30
}

/// Build a figment that layers: defaults → config.toml → RADIO_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RADIO_SUPERVISOR__AUTOSTART=true`  →  `supervisor.autostart = true`
///   `RADIO_ENCODER__AUDIO_BITRATE=192k`  →  `encoder.audio_bitrate = "192k"`
pub fn load_config(layout: &RadioConfig) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(layout.config_toml_path()))
        .merge(Env::prefixed("RADIO_").split("__"))
}

/// The encoder configuration to boot with: the persisted runtime copy if one
/// exists, otherwise the `[encoder]` section.
pub fn initial_relay_config(file: &FileConfig, layout: &RadioConfig) -> Result<RelayConfig> {
    let path = layout.relay_config_path();
    match RelayConfig::load(&path)
        .with_context(|| format!("Failed to load persisted encoder config: {:?}", path))?
    {
        Some(persisted) => {
            info!("Using persisted encoder config from {}", path.display());
            Ok(persisted)
        }
        None => Ok(file.encoder.clone()),
    }
}

// =============================================================================
// Directory layout config (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RadioConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub state_dir: PathBuf,
}

impl RadioConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".radiocity"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let state_dir = data_dir.join("state");
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory: {:?}", state_dir))?;

        let db_path = data_dir.join("radiocity.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            db_path,
            state_dir,
        })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    /// Where the supervisor publishes its status record.
    pub fn status_path(&self) -> PathBuf {
        self.state_dir.join("encoder-status.json")
    }

    /// Where accepted encoder config patches are persisted.
    pub fn relay_config_path(&self) -> PathBuf {
        self.state_dir.join("relay.toml")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
