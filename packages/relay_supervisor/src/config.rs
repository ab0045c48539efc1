use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use tracing::info;

use crate::error::ConfigError;
use crate::process::EncoderCommand;

const INPUT_SCHEMES: &[&str] = &["rtmp", "rtmps", "srt", "http", "https"];
const RELAY_SCHEMES: &[&str] = &["rtmp", "rtmps"];

static BITRATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9][0-9]{0,3}k$").expect("bitrate pattern is valid"));

/// Relay configuration: what the encoder streams where, and the local
/// relay server's limits.
///
/// Lives under `[encoder]` in config.toml; runtime changes made through
/// [`RelayConfig::apply`] are persisted separately and take precedence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_input_url")]
    pub input_url: String,
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Stream key appended to `relay_url`
    #[serde(default)]
    pub credential: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_rtmp_port")]
    pub rtmp_port: u16,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_hls_fragment_secs")]
    pub hls_fragment_secs: u32,
    #[serde(default = "default_hls_playlist_secs")]
    pub hls_playlist_secs: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            input_url: default_input_url(),
            relay_url: default_relay_url(),
            credential: String::new(),
            audio_bitrate: default_audio_bitrate(),
            ffmpeg_path: default_ffmpeg_path(),
            rtmp_port: default_rtmp_port(),
            chunk_size: default_chunk_size(),
            max_connections: default_max_connections(),
            hls_fragment_secs: default_hls_fragment_secs(),
            hls_playlist_secs: default_hls_playlist_secs(),
        }
    }
}

fn default_input_url() -> String {
    "rtmp://127.0.0.1:1935/live/stream".to_string()
}
fn default_relay_url() -> String {
    "rtmps://127.0.0.1:443/live/".to_string()
}
fn default_audio_bitrate() -> String {
    "128k".to_string()
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_rtmp_port() -> u16 {
    1935
}
fn default_chunk_size() -> u32 {
    4096
}
fn default_max_connections() -> u32 {
    1000
}
fn default_hls_fragment_secs() -> u32 {
    3
}
fn default_hls_playlist_secs() -> u32 {
    60
}

/// Partial update for [`RelayConfig`]. Absent fields are left unchanged.
///
/// Numeric fields are wider than their targets so out-of-range input is
/// reported as a validation error rather than a decode failure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfigPatch {
    #[serde(default, alias = "inputUrl")]
    pub input_url: Option<String>,
    #[serde(default, alias = "relayUrl")]
    pub relay_url: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default, alias = "audioBitrate")]
    pub audio_bitrate: Option<String>,
    #[serde(default, alias = "rtmpPort")]
    pub rtmp_port: Option<i64>,
    #[serde(default, alias = "chunkSize")]
    pub chunk_size: Option<i64>,
    #[serde(default, alias = "maxConnections")]
    pub max_connections: Option<i64>,
    #[serde(default, alias = "hlsFragmentSecs")]
    pub hls_fragment_secs: Option<i64>,
    #[serde(default, alias = "hlsPlaylistSecs")]
    pub hls_playlist_secs: Option<i64>,
}

impl RelayConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl RelayConfig {
    /// Validate `patch` and return the merged configuration.
    ///
    /// Every provided field is checked; on any error `self` is the
    /// configuration that stays in effect.
    pub fn apply(&self, patch: &RelayConfigPatch) -> Result<RelayConfig, ConfigError> {
        let mut next = self.clone();

        if let Some(url) = &patch.input_url {
            next.input_url = validate_url("input_url", url, INPUT_SCHEMES)?;
        }
        if let Some(url) = &patch.relay_url {
            next.relay_url = validate_url("relay_url", url, RELAY_SCHEMES)?;
        }
        if let Some(credential) = &patch.credential {
            let credential = credential.trim();
            if credential.chars().any(char::is_whitespace) {
                return Err(ConfigError::out_of_range(
                    "credential",
                    "must not contain whitespace",
                ));
            }
            next.credential = credential.to_string();
        }
        if let Some(bitrate) = &patch.audio_bitrate {
            let bitrate = bitrate.trim();
            if !BITRATE_RE.is_match(bitrate) {
                return Err(ConfigError::out_of_range(
                    "audio_bitrate",
                    format!("expected a value like 128k, got {:?}", bitrate),
                ));
            }
            next.audio_bitrate = bitrate.to_string();
        }
        if let Some(port) = patch.rtmp_port {
            next.rtmp_port = in_range("rtmp_port", port, 1, 65_535)? as u16;
        }
        if let Some(chunk) = patch.chunk_size {
            next.chunk_size = in_range("chunk_size", chunk, 128, 65_536)?;
        }
        if let Some(max) = patch.max_connections {
            next.max_connections = in_range("max_connections", max, 1, 10_000)?;
        }
        if let Some(fragment) = patch.hls_fragment_secs {
            next.hls_fragment_secs = in_range("hls_fragment_secs", fragment, 1, 60)?;
        }
        if let Some(playlist) = patch.hls_playlist_secs {
            next.hls_playlist_secs = in_range("hls_playlist_secs", playlist, 1, 3_600)?;
        }
        if (patch.hls_fragment_secs.is_some() || patch.hls_playlist_secs.is_some())
            && next.hls_playlist_secs < next.hls_fragment_secs
        {
            return Err(ConfigError::out_of_range(
                "hls_playlist_secs",
                format!(
                    "playlist length {}s is shorter than fragment length {}s",
                    next.hls_playlist_secs, next.hls_fragment_secs
                ),
            ));
        }

        Ok(next)
    }

    /// Full destination URL: relay endpoint plus stream key.
    pub fn output_url(&self) -> String {
        if self.credential.is_empty() {
            self.relay_url.clone()
        } else if self.relay_url.ends_with('/') {
            format!("{}{}", self.relay_url, self.credential)
        } else {
            format!("{}/{}", self.relay_url, self.credential)
        }
    }

    /// Encoder argv: read the local input, re-encode audio, push to the relay.
    pub fn to_command(&self) -> EncoderCommand {
        let output_url = self.output_url();
        let args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "info",
            "-stats",
            "-i",
            self.input_url.as_str(),
            "-c:v",
            "copy",
            "-c:a",
            "aac",
            "-b:a",
            self.audio_bitrate.as_str(),
            "-ar",
            "44100",
            "-f",
            "flv",
            output_url.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        EncoderCommand {
            program: self.ffmpeg_path.clone(),
            args,
        }
    }

    /// Copy safe to hand to API clients.
    pub fn redacted(&self) -> RelayConfig {
        let mut copy = self.clone();
        if !copy.credential.is_empty() {
            copy.credential = "****".to_string();
        }
        copy
    }

    /// Load a previously persisted configuration, if one exists.
    pub fn load(path: &Path) -> Result<Option<RelayConfig>, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConfigError::Persist(e.to_string())),
        };
        toml::from_str(&text)
            .map(Some)
            .map_err(|e| ConfigError::Persist(format!("{}: {}", path.display(), e)))
    }

    /// Write the configuration to `path` (temp file + rename).
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self).map_err(|e| ConfigError::Persist(e.to_string()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::Persist(e.to_string()))?;
        }
        let tmp = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| ConfigError::Persist(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ConfigError::Persist(e.to_string()))?;
        info!("Saved relay configuration to {}", path.display());
        Ok(())
    }
}

fn validate_url(field: &'static str, url: &str, schemes: &[&str]) -> Result<String, ConfigError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ConfigError::out_of_range(field, "must not be empty"));
    }
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| ConfigError::out_of_range(field, "missing scheme"))?;
    if !schemes.contains(&scheme.as_str()) {
        return Err(ConfigError::out_of_range(
            field,
            format!("scheme {:?} not one of {}", scheme, schemes.join(", ")),
        ));
    }
    if url.chars().any(char::is_whitespace) {
        return Err(ConfigError::out_of_range(field, "must not contain whitespace"));
    }
    Ok(url.to_string())
}

fn in_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<u32, ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::out_of_range(
            field,
            format!("{} is outside {}..={}", value, min, max),
        ));
    }
    Ok(value as u32)
}
