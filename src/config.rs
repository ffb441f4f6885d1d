//! Configuration loading: the TOML settings view the core consumes (RTSP
//! URLs, transport, overlap seconds, sample rate, bit depth, capture-window
//! duration) plus CLI overrides.
//!
//! This is a bootstrap-only stage: the core persists no runtime state, so
//! there's no second stage to layer on top of the TOML file — just the file
//! plus the CLI overrides applied in [`Config::load`].

use crate::error::{IngestError, Result};
use crate::manager::{ManagerSettings, SourceSpec};
use crate::supervisor::Transport;
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_sample_rate() -> u32 {
    48_000
}

fn default_bit_depth() -> u32 {
    16
}

fn default_overlap_seconds() -> f64 {
    0.5
}

fn default_chunk_seconds() -> f64 {
    3.0
}

fn default_capture_window_seconds() -> u64 {
    300
}

fn default_decoder_command() -> String {
    "ffmpeg".to_string()
}

fn default_stderr_capture_bytes() -> usize {
    4096
}

fn default_analysis_ring_capacity() -> usize {
    1 << 20 // 1 MiB, comfortably larger than one chunk at 48kHz/16-bit/mono
}

fn default_level_channel_capacity() -> usize {
    64
}

fn default_chunk_channel_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TomlTransport {
    Tcp,
    Udp,
}

impl From<TomlTransport> for Transport {
    fn from(t: TomlTransport) -> Self {
        match t {
            TomlTransport::Tcp => Transport::Tcp,
            TomlTransport::Udp => Transport::Udp,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TomlSource {
    url: String,
    #[serde(default = "default_transport")]
    transport: TomlTransport,
    #[serde(default)]
    display_name: Option<String>,
}

fn default_transport() -> TomlTransport {
    TomlTransport::Tcp
}

#[derive(Debug, Clone, Deserialize)]
struct TomlAudio {
    #[serde(default = "default_sample_rate")]
    sample_rate: u32,
    #[serde(default = "default_bit_depth")]
    bit_depth: u32,
    #[serde(default = "default_overlap_seconds")]
    overlap_seconds: f64,
    #[serde(default = "default_chunk_seconds")]
    chunk_seconds: f64,
    #[serde(default = "default_capture_window_seconds")]
    capture_window_seconds: u64,
}

impl Default for TomlAudio {
    fn default() -> Self {
        TomlAudio {
            sample_rate: default_sample_rate(),
            bit_depth: default_bit_depth(),
            overlap_seconds: default_overlap_seconds(),
            chunk_seconds: default_chunk_seconds(),
            capture_window_seconds: default_capture_window_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TomlDecoder {
    #[serde(default = "default_decoder_command")]
    command: String,
    #[serde(default = "default_stderr_capture_bytes")]
    stderr_capture_bytes: usize,
}

impl Default for TomlDecoder {
    fn default() -> Self {
        TomlDecoder {
            command: default_decoder_command(),
            stderr_capture_bytes: default_stderr_capture_bytes(),
        }
    }
}

/// Bootstrap configuration loaded from a TOML file: a minimal settings view
/// of RTSP URLs, transport, overlap seconds, sample rate, bit depth, and
/// capture-window duration.
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(rename = "sources")]
    sources: Vec<TomlSource>,
    #[serde(default)]
    audio: TomlAudio,
    #[serde(default)]
    decoder: TomlDecoder,
}

/// Fully-resolved runtime configuration: the parsed source list plus
/// per-fleet audio/decoder settings, with CLI overrides applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub sources: Vec<SourceSpec>,
    pub settings: ManagerSettings,
    pub decoder_command: String,
}

impl Config {
    /// Load configuration from a TOML file, with optional command-line
    /// overrides for the decoder command and sample rate.
    pub async fn load(
        config_path: &Path,
        decoder_override: Option<String>,
        sample_rate_override: Option<u32>,
    ) -> Result<Self> {
        let toml_str = tokio::fs::read_to_string(config_path)
            .await
            .map_err(|e| IngestError::Validation(format!("failed to read config file: {e}")))?;

        let toml_config: TomlConfig = toml::from_str(&toml_str)
            .map_err(|e| IngestError::Validation(format!("failed to parse TOML config: {e}")))?;

        if toml_config.sources.is_empty() {
            return Err(IngestError::Validation(
                "config must declare at least one [[sources]] entry".to_string(),
            ));
        }

        let sources: Vec<SourceSpec> = toml_config
            .sources
            .into_iter()
            .map(|s| SourceSpec {
                display_name: s.display_name.clone().unwrap_or_else(|| s.url.clone()),
                transport: s.transport.into(),
                url: s.url,
            })
            .collect();

        let sample_rate = sample_rate_override.unwrap_or(toml_config.audio.sample_rate);
        let settings = ManagerSettings {
            sample_rate,
            bit_depth: toml_config.audio.bit_depth,
            overlap_seconds: toml_config.audio.overlap_seconds,
            chunk_seconds: toml_config.audio.chunk_seconds,
            capture_window_seconds: toml_config.audio.capture_window_seconds,
            analysis_ring_capacity: default_analysis_ring_capacity(),
            level_channel_capacity: default_level_channel_capacity(),
            chunk_channel_capacity: default_chunk_channel_capacity(),
            stderr_capture_bytes: toml_config.decoder.stderr_capture_bytes,
        };

        let decoder_command = decoder_override.unwrap_or(toml_config.decoder.command);

        Ok(Config {
            sources,
            settings,
            decoder_command,
        })
    }
}

/// Default bootstrap config path used as the CLI's `--config` default
/// value.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("audio-ingest.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_sources_and_audio_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio-ingest.toml");
        tokio::fs::write(
            &path,
            r#"
[[sources]]
url = "rtsp://192.168.1.50:554/stream1"
transport = "tcp"
display_name = "Coop Camera"

[[sources]]
url = "rtsp://192.168.1.51:554/stream1"
transport = "udp"

[audio]
sample_rate = 48000
bit_depth = 16
overlap_seconds = 0.5
chunk_seconds = 3.0
capture_window_seconds = 300

[decoder]
command = "ffmpeg"
"#,
        )
        .await
        .unwrap();

        let config = Config::load(&path, None, None).await.unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].display_name, "Coop Camera");
        assert_eq!(config.sources[1].display_name, "rtsp://192.168.1.51:554/stream1");
        assert_eq!(config.sources[1].transport, Transport::Udp);
        assert_eq!(config.settings.sample_rate, 48_000);
        assert_eq!(config.decoder_command, "ffmpeg");
        assert_eq!(config.settings.stderr_capture_bytes, 4096);
    }

    #[tokio::test]
    async fn decoder_stderr_capture_bytes_overrides_the_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio-ingest.toml");
        tokio::fs::write(
            &path,
            r#"
[[sources]]
url = "rtsp://cam/stream"

[decoder]
command = "ffmpeg"
stderr_capture_bytes = 8192
"#,
        )
        .await
        .unwrap();

        let config = Config::load(&path, None, None).await.unwrap();
        assert_eq!(config.settings.stderr_capture_bytes, 8192);
    }

    #[tokio::test]
    async fn empty_source_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        tokio::fs::write(&path, "sources = []\n").await.unwrap();
        let err = Config::load(&path, None, None).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }

    #[tokio::test]
    async fn cli_overrides_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio-ingest.toml");
        tokio::fs::write(
            &path,
            r#"
[[sources]]
url = "rtsp://cam/stream"

[decoder]
command = "ffmpeg"
"#,
        )
        .await
        .unwrap();

        let config = Config::load(&path, Some("avconv".to_string()), Some(44_100))
            .await
            .unwrap();
        assert_eq!(config.decoder_command, "avconv");
        assert_eq!(config.settings.sample_rate, 44_100);
    }
}
