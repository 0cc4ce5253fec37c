//! Application-wide configuration.
//!
//! Values are layered with `figment`: built-in defaults, then `config.toml`,
//! then `config.yaml`, then `AMIRA_`-prefixed environment variables (nested
//! keys separated by `__`, e.g. `AMIRA_ENDPOINT__BLANK_THRESHOLD`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::asr::endpoint::EndpointConfig;
use crate::asr::features::FeatureConfig;
use crate::asr::options::{DecodeOptions, SessionConfig};
use crate::error::{AppError, Result};
use crate::model::{Device, TokenId};
use crate::reliability::{LogFormat, TracingConfig};

/// Serde helper for Duration serialization/deserialization as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,

    /// Acoustic model weights.
    pub model_path: PathBuf,
    /// Units file, one `<token> <id>` pair per line.
    pub units_path: PathBuf,
    /// `cpu`, `cuda` or `cuda:N`.
    pub device: String,

    pub max_concurrent_sessions: usize,
    pub max_concurrent_batches: usize,
    /// Audio chunks buffered per session before the socket reader waits.
    pub input_queue_capacity: usize,
    /// A connection without traffic for this long is closed.
    #[serde(with = "duration_secs")]
    pub session_idle_timeout: Duration,
    /// How long shutdown waits for live sessions.
    #[serde(with = "duration_secs")]
    pub shutdown_grace_period: Duration,

    // Feature front end
    pub sample_rate: u32,
    pub feature_dim: usize,
    pub frame_length_ms: u32,
    pub frame_shift_ms: u32,

    // Decoding
    pub beam_size: usize,
    pub first_beam_size: usize,
    pub chunk_size: usize,
    pub ctc_weight: f32,
    pub rescoring_weight: f32,
    pub blank_id: TokenId,
    pub endpoint_enabled: bool,
    pub endpoint: EndpointConfig,
    /// Longest utterance decoded before it is cut; zero disables the cut.
    pub max_utterance_ms: u64,

    // Session defaults, overridable per start message
    pub nbest: usize,
    pub enable_timestamp: bool,
    pub context_score: f32,
    pub language: String,
    pub continuous_decoding: bool,
    pub reverse_weight: f32,

    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        let decode = DecodeOptions::default();
        let session = SessionConfig::default();
        let features = FeatureConfig::default();
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: 10086,
            model_path: PathBuf::from("model/final.json"),
            units_path: PathBuf::from("model/units.txt"),
            device: "cpu".to_string(),
            max_concurrent_sessions: 32,
            max_concurrent_batches: 8,
            input_queue_capacity: crate::asr::resource::DEFAULT_INPUT_QUEUE_CAPACITY,
            session_idle_timeout: Duration::from_secs(30),
            shutdown_grace_period: Duration::from_secs(10),
            sample_rate: features.sample_rate,
            feature_dim: features.num_bins,
            frame_length_ms: features.frame_length_ms,
            frame_shift_ms: features.frame_shift_ms,
            beam_size: decode.beam_size,
            first_beam_size: decode.first_beam_size,
            chunk_size: decode.chunk_size,
            ctc_weight: decode.ctc_weight,
            rescoring_weight: decode.rescoring_weight,
            blank_id: decode.blank_id,
            endpoint_enabled: true,
            endpoint: EndpointConfig::default(),
            max_utterance_ms: decode.max_utterance_frames as u64 * decode.frame_shift_ms as u64,
            nbest: session.nbest,
            enable_timestamp: session.enable_timestamp,
            context_score: session.context_score,
            language: session.language,
            continuous_decoding: session.continuous_decoding,
            reverse_weight: session.reverse_weight,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest priority)
    /// 2. config.yaml (if exists)
    /// 3. config.toml (if exists)
    /// 4. Built-in defaults (lowest priority)
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file("config.toml"))
                .merge(Yaml::file("config.yaml"))
                .merge(Env::prefixed("AMIRA_").split("__")),
        )
    }

    /// Extract and validate a configuration layered over the defaults.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(figment)
            .extract()
            .map_err(|e| AppError::Configuration(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_host.is_empty() {
            return Err(AppError::Configuration(
                "server_host cannot be empty".to_string(),
            ));
        }
        self.validate_path(&self.model_path, "model_path")?;
        self.validate_path(&self.units_path, "units_path")?;
        self.device()?;

        if self.max_concurrent_sessions == 0 || self.max_concurrent_batches == 0 {
            return Err(AppError::Configuration(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.input_queue_capacity == 0 {
            return Err(AppError::Configuration(
                "input_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.sample_rate == 0 || self.feature_dim == 0 {
            return Err(AppError::Configuration(
                "sample_rate and feature_dim must be positive".to_string(),
            ));
        }
        if self.frame_shift_ms == 0 || self.frame_length_ms < self.frame_shift_ms {
            return Err(AppError::Configuration(format!(
                "frame length {} ms must be at least the frame shift {} ms (> 0)",
                self.frame_length_ms, self.frame_shift_ms
            )));
        }
        if self.beam_size == 0 || self.first_beam_size == 0 {
            return Err(AppError::Configuration(
                "beam sizes must be at least 1".to_string(),
            ));
        }
        if self.ctc_weight < 0.0 || self.rescoring_weight < 0.0 {
            return Err(AppError::Configuration(
                "ctc_weight and rescoring_weight must not be negative".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.endpoint.blank_threshold) {
            return Err(AppError::Configuration(format!(
                "endpoint.blank_threshold must be within [0, 1], got {}",
                self.endpoint.blank_threshold
            )));
        }
        self.default_session_config()
            .validate()
            .map_err(|e| AppError::Configuration(e.to_string()))?;
        Ok(())
    }

    /// Reject paths with traversal or control characters.
    fn validate_path(&self, path: &Path, field_name: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        if path_str.is_empty() {
            return Err(AppError::Configuration(format!("{} is empty", field_name)));
        }
        if path_str.contains("../..") || path_str.contains('\0') {
            return Err(AppError::Configuration(format!(
                "{} contains potentially unsafe path components",
                field_name
            )));
        }
        if path_str.chars().any(|c| c.is_control() && c != '\t') {
            return Err(AppError::Configuration(format!(
                "{} contains invalid control characters",
                field_name
            )));
        }
        if !path.exists() {
            debug!(field = field_name, ?path, "Configured path does not exist yet");
        }
        Ok(())
    }

    pub fn device(&self) -> Result<Device> {
        self.device.parse()
    }

    pub fn feature_config(&self) -> FeatureConfig {
        FeatureConfig {
            sample_rate: self.sample_rate,
            num_bins: self.feature_dim,
            frame_length_ms: self.frame_length_ms,
            frame_shift_ms: self.frame_shift_ms,
        }
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            beam_size: self.beam_size,
            first_beam_size: self.first_beam_size,
            chunk_size: self.chunk_size,
            ctc_weight: self.ctc_weight,
            rescoring_weight: self.rescoring_weight,
            blank_id: self.blank_id,
            frame_shift_ms: self.frame_shift_ms,
            endpoint: self.endpoint_enabled.then(|| self.endpoint.clone()),
            max_utterance_frames: (self.max_utterance_ms / self.frame_shift_ms.max(1) as u64)
                as usize,
        }
    }

    pub fn default_session_config(&self) -> SessionConfig {
        SessionConfig {
            nbest: self.nbest,
            enable_timestamp: self.enable_timestamp,
            context_words: Vec::new(),
            context_score: self.context_score,
            language: self.language.clone(),
            continuous_decoding: self.continuous_decoding,
            reverse_weight: self.reverse_weight,
        }
    }

    pub fn tracing_config(&self) -> TracingConfig {
        TracingConfig {
            log_level: self.log_level.clone(),
            format: self.log_format,
            ..Default::default()
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Export configuration to TOML format
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AppError::Configuration(format!("Failed to serialize to TOML: {}", e)))
    }

    /// Export configuration to YAML format
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| AppError::Configuration(format!("Failed to serialize to YAML: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> Result<Config> {
        Config::from_figment(Figment::from(Toml::string(toml)))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.device().unwrap(), Device::Cpu);
        assert!(config.decode_options().endpoint.is_some());
        assert_eq!(config.default_session_config(), SessionConfig::default());
    }

    #[test]
    fn test_toml_overrides() {
        let config = from_toml(
            r#"
            server_port = 9000
            device = "cuda:1"
            chunk_size = 8
            endpoint_enabled = false
            continuous_decoding = true
            max_utterance_ms = 30000
            shutdown_grace_period = 3
            log_format = "json"

            [endpoint]
            blank_threshold = 0.7
            rule1 = { must_decode_something = false, min_trailing_silence_ms = 4000, min_utterance_length_ms = 0 }
            rule2 = { must_decode_something = true, min_trailing_silence_ms = 500, min_utterance_length_ms = 0 }
            rule3 = { must_decode_something = true, min_trailing_silence_ms = 0, min_utterance_length_ms = 15000 }
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
        assert_eq!(config.device().unwrap(), Device::Cuda(1));
        assert_eq!(config.decode_options().chunk_size, 8);
        assert!(config.decode_options().endpoint.is_none());
        assert_eq!(config.decode_options().max_utterance_frames, 3000);
        assert_eq!(config.endpoint.rule2.min_trailing_silence_ms, 500);
        assert!(config.default_session_config().continuous_decoding);
        assert_eq!(config.shutdown_grace_period, Duration::from_secs(3));
        assert_eq!(config.tracing_config().format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for toml in [
            r#"device = "tpu""#,
            "beam_size = 0",
            "nbest = 0",
            "reverse_weight = 2.0",
            "frame_shift_ms = 0",
            "input_queue_capacity = 0",
            r#"model_path = "../../etc/passwd""#,
        ] {
            assert!(
                matches!(from_toml(toml), Err(AppError::Configuration(_))),
                "accepted {}",
                toml
            );
        }
    }

    #[test]
    fn test_export_round_trips_through_toml() {
        let config = Config::default();
        let exported = config.to_toml().unwrap();
        assert_eq!(from_toml(&exported).unwrap(), config);
        assert!(config.to_yaml().unwrap().contains("server_port: 10086"));
    }
}
