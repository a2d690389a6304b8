//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Encoder-side settings that size the writer's in-memory queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingConfig {
    /// Number of encoding threads feeding the writer (auto-detected if None)
    pub threads: Option<u32>,
    /// Frames held in memory per encoding thread (1.0-4.0, default 1.1)
    #[serde(default = "default_memory_factor")]
    pub memory_factor: f32,
}

fn default_memory_factor() -> f32 {
    1.1
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            threads: None,
            memory_factor: default_memory_factor(),
        }
    }
}

/// Description of the package being assembled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageConfig {
    /// Package name, used in the manifest
    #[serde(default = "default_package_name")]
    pub name: String,
    /// Whether the picture asset carries separate left/right eye frames
    #[serde(default)]
    pub stereoscopic: bool,
    /// Frames per second
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Sound channels (0 = no sound asset)
    #[serde(default)]
    pub audio_channels: u32,
    /// Sound sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Expected number of frames, used only for progress reporting
    #[serde(default)]
    pub total_frames: Option<u64>,
}

fn default_package_name() -> String {
    "reelpack".to_string()
}

fn default_frame_rate() -> u32 {
    24
}

fn default_sample_rate() -> u32 {
    48000
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            name: default_package_name(),
            stereoscopic: false,
            frame_rate: default_frame_rate(),
            audio_channels: 0,
            sample_rate: default_sample_rate(),
            total_frames: None,
        }
    }
}

/// Manifest signing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SigningConfig {
    /// Sign the manifest after it is written (default false)
    #[serde(default)]
    pub enabled: bool,
    /// Shared signing key
    #[serde(default)]
    pub key: Option<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub package: PackageConfig,
    #[serde(default)]
    pub signing: SigningConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - REELPACK_ENCODING_THREADS -> encoding.threads
    /// - REELPACK_MEMORY_FACTOR -> encoding.memory_factor
    /// - REELPACK_STEREOSCOPIC -> package.stereoscopic
    /// - REELPACK_SIGNING_ENABLED -> signing.enabled
    /// - REELPACK_SIGNING_KEY -> signing.key
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("REELPACK_ENCODING_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.encoding.threads = Some(threads);
            }
        }

        if let Ok(val) = env::var("REELPACK_MEMORY_FACTOR") {
            if let Ok(factor) = val.parse::<f32>() {
                self.encoding.memory_factor = factor;
            }
        }

        if let Ok(val) = env::var("REELPACK_STEREOSCOPIC") {
            if let Some(b) = parse_bool(&val) {
                self.package.stereoscopic = b;
            }
        }

        if let Ok(val) = env::var("REELPACK_SIGNING_ENABLED") {
            if let Some(b) = parse_bool(&val) {
                self.signing.enabled = b;
            }
        }

        if let Ok(val) = env::var("REELPACK_SIGNING_KEY") {
            if !val.is_empty() {
                self.signing.key = Some(val);
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Number of encoding threads, falling back to the logical core count
    pub fn encoding_threads(&self) -> u32 {
        self.encoding
            .threads
            .filter(|&t| t > 0)
            .unwrap_or_else(|| num_cpus::get() as u32)
    }
}

// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Env var tests must not interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        env::remove_var("REELPACK_ENCODING_THREADS");
        env::remove_var("REELPACK_MEMORY_FACTOR");
        env::remove_var("REELPACK_STEREOSCOPIC");
        env::remove_var("REELPACK_SIGNING_ENABLED");
        env::remove_var("REELPACK_SIGNING_KEY");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            threads in proptest::option::of(1u32..256),
            factor in 1.0f32..4.0,
            stereo in proptest::bool::ANY,
            frame_rate in 1u32..120,
            channels in 0u32..16,
            signing in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[encoding]
{}
memory_factor = {}

[package]
name = "feature"
stereoscopic = {}
frame_rate = {}
audio_channels = {}

[signing]
enabled = {}
"#,
                threads.map(|t| format!("threads = {}", t)).unwrap_or_default(),
                factor,
                stereo,
                frame_rate,
                channels,
                signing
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.encoding.threads, threads);
            prop_assert!((config.encoding.memory_factor - factor).abs() < 0.0001);
            prop_assert_eq!(config.package.name, "feature");
            prop_assert_eq!(config.package.stereoscopic, stereo);
            prop_assert_eq!(config.package.frame_rate, frame_rate);
            prop_assert_eq!(config.package.audio_channels, channels);
            prop_assert_eq!(config.signing.enabled, signing);
        }

        #[test]
        fn prop_env_overrides_encoding_threads(
            initial in proptest::option::of(1u32..128),
            override_threads in 1u32..256,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[encoding]\n{}\n",
                initial.map(|t| format!("threads = {}", t)).unwrap_or_default()
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");
            env::set_var("REELPACK_ENCODING_THREADS", override_threads.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoding.threads, Some(override_threads));
            prop_assert_eq!(config.encoding_threads(), override_threads);
        }

        #[test]
        fn prop_env_overrides_stereoscopic(
            initial in proptest::bool::ANY,
            override_stereo in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[package]\nstereoscopic = {}\n", initial);

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");
            env::set_var("REELPACK_STEREOSCOPIC", override_stereo.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.package.stereoscopic, override_stereo);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.encoding.threads, None);
        assert!((config.encoding.memory_factor - 1.1).abs() < 0.0001);
        assert_eq!(config.package.name, "reelpack");
        assert!(!config.package.stereoscopic);
        assert_eq!(config.package.frame_rate, 24);
        assert_eq!(config.package.audio_channels, 0);
        assert_eq!(config.package.sample_rate, 48000);
        assert!(!config.signing.enabled);
        assert!(config.signing.key.is_none());
    }

    #[test]
    fn test_signing_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("REELPACK_SIGNING_ENABLED", "yes");
        env::set_var("REELPACK_SIGNING_KEY", "s3cret");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.signing.enabled);
        assert_eq!(config.signing.key.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_invalid_bool_override_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        config.package.stereoscopic = true;
        env::set_var("REELPACK_STEREOSCOPIC", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.package.stereoscopic);
    }

    #[test]
    fn test_zero_threads_falls_back_to_core_count() {
        let mut config = Config::default();
        config.encoding.threads = Some(0);
        assert!(config.encoding_threads() >= 1);
    }
}
