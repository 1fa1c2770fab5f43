//! Engine configuration (JSON file + `QUELL_*` environment overrides).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{QuellError, Result};

/// How aggressively denoised output is attenuated after inference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseReductionLevel {
    Low,
    #[default]
    Medium,
    High,
    Auto,
}

impl NoiseReductionLevel {
    /// Scalar applied to every denoised sample.
    pub fn output_scale(self) -> f32 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 0.9,
            Self::High => 0.8,
            Self::Auto => 0.9,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" | "light" => Self::Low,
            "high" | "aggressive" => Self::High,
            "auto" | "adaptive" => Self::Auto,
            _ => Self::Medium,
        }
    }
}

/// Denoising backend requested by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// RNNoise recurrent network via the module loader chain.
    #[default]
    Rnnoise,
    /// Amplitude gate only; skips module loading entirely.
    Gate,
}

/// Configuration for `NoiseEngine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct EngineConfig {
    pub noise_reduction_level: NoiseReductionLevel,
    /// Device buffer (frames) requested by the worker pipeline.
    pub buffer_size: u32,
    pub algorithm: Algorithm,
    /// Destroy the engine after `cleanup_delay_ms` without active streams.
    pub auto_cleanup: bool,
    pub cleanup_delay_ms: u64,
    /// Fall back to the amplitude gate instead of failing initialization.
    pub allow_degraded: bool,
    /// Static pre-gain applied after AGC. Clamped to 0.5–3.0.
    pub input_gain: f32,
    /// Recording cycle length for chunked recording.
    pub chunk_duration_ms: u64,
    /// Upper bound on module loading before failing fast.
    pub load_timeout_ms: u64,
    /// Cadence of metrics snapshots, independent of callback rate.
    pub metrics_interval_ms: u64,
    pub agc_target_level: f32,
    pub agc_max_gain: f32,
    /// RNNoise weights file shipped next to the application.
    pub model_path: Option<PathBuf>,
    /// Remote RNNoise weights (requires the `remote-model` feature).
    pub model_url: Option<String>,
    pub preferred_input_device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            noise_reduction_level: NoiseReductionLevel::Medium,
            buffer_size: 480,
            algorithm: Algorithm::Rnnoise,
            auto_cleanup: false,
            cleanup_delay_ms: 30_000,
            allow_degraded: true,
            input_gain: 1.0,
            chunk_duration_ms: 5_000,
            load_timeout_ms: 5_000,
            metrics_interval_ms: 100,
            agc_target_level: 0.1,
            agc_max_gain: 10.0,
            model_path: None,
            model_url: None,
            preferred_input_device: None,
        }
    }
}

impl EngineConfig {
    pub fn normalize(&mut self) {
        if !self.input_gain.is_finite() {
            self.input_gain = 1.0;
        }
        self.input_gain = self.input_gain.clamp(0.5, 3.0);
        self.buffer_size = self.buffer_size.clamp(128, 8_192);
        self.cleanup_delay_ms = self.cleanup_delay_ms.clamp(100, 3_600_000);
        self.chunk_duration_ms = self.chunk_duration_ms.clamp(250, 600_000);
        self.load_timeout_ms = self.load_timeout_ms.clamp(100, 60_000);
        self.metrics_interval_ms = self.metrics_interval_ms.clamp(10, 10_000);
        if !self.agc_target_level.is_finite() {
            self.agc_target_level = 0.1;
        }
        self.agc_target_level = self.agc_target_level.clamp(0.001, 1.0);
        if !self.agc_max_gain.is_finite() {
            self.agc_max_gain = 10.0;
        }
        self.agc_max_gain = self.agc_max_gain.clamp(1.0, 100.0);
        self.model_path = self.model_path.take().filter(|p| !p.as_os_str().is_empty());
        self.model_url = self
            .model_url
            .as_ref()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
    }

    /// Reject values `normalize` cannot repair.
    pub fn validate(&self) -> Result<()> {
        if !self.input_gain.is_finite() {
            return Err(QuellError::Validation("inputGain must be finite".into()));
        }
        if self.chunk_duration_ms == 0 {
            return Err(QuellError::Validation("chunkDuration must be positive".into()));
        }
        Ok(())
    }

    /// Apply `QUELL_*` environment overrides on top of file/default values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<f32>("QUELL_INPUT_GAIN") {
            self.input_gain = v;
        }
        if let Some(v) = env_bool("QUELL_ALLOW_DEGRADED") {
            self.allow_degraded = v;
        }
        if let Some(v) = env_parse::<u64>("QUELL_LOAD_TIMEOUT_MS") {
            self.load_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("QUELL_CHUNK_DURATION_MS") {
            self.chunk_duration_ms = v;
        }
        if let Ok(v) = std::env::var("QUELL_MODEL_PATH") {
            self.model_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("QUELL_NOISE_REDUCTION") {
            self.noise_reduction_level = NoiseReductionLevel::parse(&v);
        }
        self.normalize();
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_duration_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = raw.as_str(), "ignoring unparsable environment override");
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Load configuration from `path`; a missing or malformed file yields defaults.
pub fn load_config(path: &Path) -> EngineConfig {
    let mut config = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<EngineConfig>(&raw).unwrap_or_else(|e| {
            warn!(path = ?path, error = %e, "malformed config file, using defaults");
            EngineConfig::default()
        }),
        Err(_) => EngineConfig::default(),
    };
    config.normalize();
    config
}

pub fn save_config(path: &Path, config: &EngineConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_gain_is_clamped() {
        let mut cfg = EngineConfig {
            input_gain: 7.5,
            ..EngineConfig::default()
        };
        cfg.normalize();
        assert_eq!(cfg.input_gain, 3.0);

        cfg.input_gain = 0.1;
        cfg.normalize();
        assert_eq!(cfg.input_gain, 0.5);

        cfg.input_gain = f32::NAN;
        cfg.normalize();
        assert_eq!(cfg.input_gain, 1.0);
    }

    #[test]
    fn reduction_level_scalars() {
        assert_eq!(NoiseReductionLevel::Low.output_scale(), 1.0);
        assert_eq!(NoiseReductionLevel::Medium.output_scale(), 0.9);
        assert_eq!(NoiseReductionLevel::High.output_scale(), 0.8);
        assert_eq!(NoiseReductionLevel::Auto.output_scale(), 0.9);
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let raw = r#"{ "noiseReductionLevel": "high", "allowDegraded": false, "inputGain": 2.0 }"#;
        let cfg: EngineConfig = serde_json::from_str(raw).expect("parse config");
        assert_eq!(cfg.noise_reduction_level, NoiseReductionLevel::High);
        assert!(!cfg.allow_degraded);
        assert_eq!(cfg.input_gain, 2.0);
        assert_eq!(cfg.chunk_duration_ms, 5_000);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let cfg = load_config(Path::new("/definitely/not/here/quell.json"));
        assert_eq!(cfg, {
            let mut d = EngineConfig::default();
            d.normalize();
            d
        });
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = std::env::temp_dir().join(format!("quell-config-{}", std::process::id()));
        let path = dir.join("nested").join("quell.json");
        let cfg = EngineConfig {
            noise_reduction_level: NoiseReductionLevel::High,
            chunk_duration_ms: 2_000,
            model_url: Some("https://models.example/rnnoise.rnn".into()),
            ..EngineConfig::default()
        };
        save_config(&path, &cfg).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"chunkDurationMs\": 2000"));
        assert_eq!(load_config(&path), cfg);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn empty_strings_become_none() {
        let mut cfg = EngineConfig {
            model_url: Some("   ".into()),
            preferred_input_device: Some("".into()),
            ..EngineConfig::default()
        };
        cfg.normalize();
        assert!(cfg.model_url.is_none());
        assert!(cfg.preferred_input_device.is_none());
    }
}
