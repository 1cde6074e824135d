//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but is not usable
    Invalid(String),
    /// Configuration could not be rendered as TOML
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
            ConfigError::Serialize(e) => write!(f, "Failed to write config: {}", e),
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

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// A named encode profile as written in the config file.
///
/// The table key (`[profiles.<key>]`) identifies the profile; `name` is an
/// optional display name that may also be used to refer to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileConfig {
    /// Display name (defaults to the table key when empty)
    #[serde(default)]
    pub name: String,
    /// Target video codec (h264, h265, av1)
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Constant rate factor, if quality-based encoding is wanted
    #[serde(default = "default_video_crf")]
    pub video_crf: Option<u32>,
    /// Target video bitrate such as "2M" or "1500k"
    #[serde(default)]
    pub video_bitrate: Option<String>,
    /// Target audio codec, or "copy"
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Target audio bitrate such as "128k"
    #[serde(default)]
    pub audio_bitrate: Option<String>,
    /// Apply loudness normalization when re-encoding audio
    #[serde(default)]
    pub audio_normalize: bool,
    /// Subtitle handling: "copy" or "none"
    #[serde(default = "default_subtitles")]
    pub subtitles: String,
    /// Output container (mp4, mkv)
    #[serde(default = "default_container")]
    pub container: String,
    /// Prefer hardware-accelerated encoders when available
    #[serde(default = "default_true")]
    pub hardware_accel: bool,
    /// Encoder speed preset
    #[serde(default = "default_preset")]
    pub preset: String,
}

fn default_video_codec() -> String {
    "h264".to_string()
}

fn default_video_crf() -> Option<u32> {
    Some(23)
}

fn default_audio_codec() -> String {
    "copy".to_string()
}

fn default_subtitles() -> String {
    "copy".to_string()
}

fn default_container() -> String {
    "mp4".to_string()
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            video_codec: default_video_codec(),
            video_crf: default_video_crf(),
            video_bitrate: None,
            audio_codec: default_audio_codec(),
            audio_bitrate: None,
            audio_normalize: false,
            subtitles: default_subtitles(),
            container: default_container(),
            hardware_accel: true,
            preset: default_preset(),
        }
    }
}

/// A folder watched for new media files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchFolderConfig {
    /// Root directory to watch
    pub path: PathBuf,
    /// Profile key or display name applied to files in this folder
    pub profile: String,
    /// Descend into subdirectories
    #[serde(default = "default_true")]
    pub recursive: bool,
    /// File extensions considered media (with leading dot)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Output directory; outputs are written next to the source when unset
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

fn default_extensions() -> Vec<String> {
    [".mp4", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".m4v", ".webm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Worker pool and scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Number of concurrent workers (0 = auto-derive)
    #[serde(default)]
    pub max_workers: u32,
    /// Concurrent hardware-accelerated encodes (0 = auto-derive)
    #[serde(default)]
    pub max_hardware_jobs: u32,
    /// Maximum number of pending jobs accepted by the scheduler
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Attempts allowed per job before it fails permanently
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Base delay before a failed job is retried
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Upper bound for the exponential retry delay
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// How long an idle worker waits before re-checking the queue
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Deadline for a single encoder run (0 = none)
    #[serde(default)]
    pub job_timeout_secs: u64,
    /// Log would-be encodes instead of running the encoder
    #[serde(default)]
    pub dry_run: bool,
    /// Directory where job records are persisted
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory for temporary encoder output (next to the output when unset)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_retry_limit() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    5_000
}

fn default_retry_backoff_max_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("recodex-state")
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            max_hardware_jobs: 0,
            queue_capacity: default_queue_capacity(),
            retry_limit: default_retry_limit(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: 0,
            dry_run: false,
            state_dir: default_state_dir(),
            temp_dir: None,
        }
    }
}

/// Tolerance policy for deciding that a file already matches its profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchingConfig {
    /// Require the source container to equal the profile container
    #[serde(default = "default_true")]
    pub compare_container: bool,
    /// Compare the source bitrate against the profile's target bitrate
    #[serde(default = "default_true")]
    pub compare_quality: bool,
    /// Fraction above the target bitrate still counted as a match
    #[serde(default = "default_bitrate_tolerance")]
    pub bitrate_tolerance: f64,
}

fn default_bitrate_tolerance() -> f64 {
    0.2
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            compare_container: true,
            compare_quality: true,
            bitrate_tolerance: default_bitrate_tolerance(),
        }
    }
}

/// HTTP stats server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7979".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
    #[serde(default)]
    pub watch_folders: Vec<WatchFolderConfig>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The profiles used when the config file defines none.
pub fn builtin_profiles() -> BTreeMap<String, ProfileConfig> {
    let mut profiles = BTreeMap::new();
    profiles.insert(
        "high_quality".to_string(),
        ProfileConfig {
            name: "High Quality".to_string(),
            video_codec: "h265".to_string(),
            video_crf: Some(20),
            container: "mkv".to_string(),
            preset: "slow".to_string(),
            ..ProfileConfig::default()
        },
    );
    profiles.insert(
        "balanced".to_string(),
        ProfileConfig {
            name: "Balanced".to_string(),
            video_codec: "h264".to_string(),
            video_crf: Some(23),
            audio_codec: "aac".to_string(),
            audio_bitrate: Some("128k".to_string()),
            container: "mp4".to_string(),
            preset: "medium".to_string(),
            ..ProfileConfig::default()
        },
    );
    profiles.insert(
        "small_file".to_string(),
        ProfileConfig {
            name: "Small File".to_string(),
            video_codec: "h265".to_string(),
            video_crf: Some(28),
            audio_codec: "aac".to_string(),
            audio_bitrate: Some("96k".to_string()),
            container: "mp4".to_string(),
            preset: "slower".to_string(),
            ..ProfileConfig::default()
        },
    );
    profiles
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    ///
    /// Fills in built-in profiles when none are configured and defaults each
    /// profile's display name to its key.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        if self.profiles.is_empty() {
            self.profiles = builtin_profiles();
        }
        for (key, profile) in self.profiles.iter_mut() {
            if profile.name.trim().is_empty() {
                profile.name = key.clone();
            }
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RECODEX_MAX_WORKERS -> worker.max_workers
    /// - RECODEX_MAX_HARDWARE_JOBS -> worker.max_hardware_jobs
    /// - RECODEX_QUEUE_CAPACITY -> worker.queue_capacity
    /// - RECODEX_RETRY_LIMIT -> worker.retry_limit
    /// - RECODEX_DRY_RUN -> worker.dry_run
    /// - RECODEX_STATE_DIR -> worker.state_dir
    /// - RECODEX_SERVER_BIND -> server.bind
    /// - RECODEX_LOG_LEVEL -> logging.level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RECODEX_MAX_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.worker.max_workers = workers;
            }
        }

        if let Ok(val) = env::var("RECODEX_MAX_HARDWARE_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.worker.max_hardware_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("RECODEX_QUEUE_CAPACITY") {
            if let Ok(capacity) = val.parse::<usize>() {
                self.worker.queue_capacity = capacity;
            }
        }

        if let Ok(val) = env::var("RECODEX_RETRY_LIMIT") {
            if let Ok(limit) = val.parse::<u32>() {
                self.worker.retry_limit = limit;
            }
        }

        if let Ok(val) = env::var("RECODEX_DRY_RUN") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.worker.dry_run = true,
                "false" | "0" | "no" => self.worker.dry_run = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("RECODEX_STATE_DIR") {
            if !val.is_empty() {
                self.worker.state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RECODEX_SERVER_BIND") {
            if !val.is_empty() {
                self.server.bind = val;
            }
        }

        if let Ok(val) = env::var("RECODEX_LOG_LEVEL") {
            if !val.is_empty() {
                self.logging.level = val;
            }
        }
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "worker.queue_capacity must be greater than zero".to_string(),
            ));
        }

        if self.matching.bitrate_tolerance < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "matching.bitrate_tolerance must not be negative, got {}",
                self.matching.bitrate_tolerance
            )));
        }

        for folder in &self.watch_folders {
            if self.find_profile(&folder.profile).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "watch folder {} references unknown profile '{}'",
                    folder.path.display(),
                    folder.profile
                )));
            }
        }

        Ok(())
    }

    /// Find a profile by key, falling back to its display name.
    ///
    /// Returns the key together with the profile.
    pub fn find_profile(&self, name: &str) -> Option<(&str, &ProfileConfig)> {
        if let Some((key, profile)) = self.profiles.get_key_value(name) {
            return Some((key.as_str(), profile));
        }
        self.profiles
            .iter()
            .find(|(_, profile)| profile.name == name)
            .map(|(key, profile)| (key.as_str(), profile))
    }

    /// The default configuration, built-in profiles included, as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        let mut config = Config::default();
        config.normalize();
        Ok(toml::to_string_pretty(&config)?)
    }

    /// Write the default configuration to `path`.
    ///
    /// An existing file is only replaced when `force` is set.
    pub fn write_default<P: AsRef<Path>>(path: P, force: bool) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() && !force {
            return Err(ConfigError::Invalid(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            )));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, Self::default_toml()?)?;
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("RECODEX_MAX_WORKERS");
        env::remove_var("RECODEX_MAX_HARDWARE_JOBS");
        env::remove_var("RECODEX_QUEUE_CAPACITY");
        env::remove_var("RECODEX_RETRY_LIMIT");
        env::remove_var("RECODEX_DRY_RUN");
        env::remove_var("RECODEX_STATE_DIR");
        env::remove_var("RECODEX_SERVER_BIND");
        env::remove_var("RECODEX_LOG_LEVEL");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_worker_section(
            workers in 0u32..64,
            hw_jobs in 0u32..8,
            capacity in 1usize..10_000,
            retry_limit in 0u32..10,
            dry_run in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[worker]
max_workers = {}
max_hardware_jobs = {}
queue_capacity = {}
retry_limit = {}
dry_run = {}
"#,
                workers, hw_jobs, capacity, retry_limit, dry_run
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.worker.max_workers, workers);
            prop_assert_eq!(config.worker.max_hardware_jobs, hw_jobs);
            prop_assert_eq!(config.worker.queue_capacity, capacity);
            prop_assert_eq!(config.worker.retry_limit, retry_limit);
            prop_assert_eq!(config.worker.dry_run, dry_run);
        }

        #[test]
        fn prop_env_overrides_max_workers(
            initial in 0u32..32,
            override_workers in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[worker]\nmax_workers = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RECODEX_MAX_WORKERS", override_workers.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.worker.max_workers, override_workers);
        }

        #[test]
        fn prop_env_overrides_dry_run(
            initial in proptest::bool::ANY,
            override_dry_run in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[worker]\ndry_run = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RECODEX_DRY_RUN", override_dry_run.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.worker.dry_run, override_dry_run);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.worker.max_workers, 0);
        assert_eq!(config.worker.queue_capacity, 256);
        assert_eq!(config.worker.retry_limit, 3);
        assert_eq!(config.worker.retry_backoff_ms, 5_000);
        assert!(!config.worker.dry_run);
        assert!(config.matching.compare_container);
        assert!((config.matching.bitrate_tolerance - 0.2).abs() < 1e-9);
        assert_eq!(config.server.bind, "127.0.0.1:7979");
        assert_eq!(config.logging.level, "info");

        // Built-in profiles fill in when none are configured
        assert_eq!(config.profiles.len(), 3);
        assert!(config.profiles.contains_key("balanced"));
    }

    #[test]
    fn test_profile_defaults_and_display_name() {
        let toml_str = r#"
[profiles.archive]
video_codec = "av1"
container = "mkv"
"#;
        let config = Config::parse_toml(toml_str).expect("Valid TOML");

        assert_eq!(config.profiles.len(), 1);
        let profile = &config.profiles["archive"];
        assert_eq!(profile.name, "archive");
        assert_eq!(profile.video_codec, "av1");
        assert_eq!(profile.video_crf, Some(23));
        assert_eq!(profile.audio_codec, "copy");
        assert_eq!(profile.subtitles, "copy");
        assert!(profile.hardware_accel);
    }

    #[test]
    fn test_find_profile_by_key_and_name() {
        let config = Config::parse_toml("").expect("Valid TOML");

        let (key, profile) = config.find_profile("balanced").expect("key lookup");
        assert_eq!(key, "balanced");
        assert_eq!(profile.video_codec, "h264");

        let (key, profile) = config.find_profile("Small File").expect("name lookup");
        assert_eq!(key, "small_file");
        assert_eq!(profile.video_crf, Some(28));

        assert!(config.find_profile("BALANCED").is_none());
        assert!(config.find_profile("Non Existent Profile").is_none());
    }

    #[test]
    fn test_validate_rejects_unknown_watch_profile() {
        let toml_str = r#"
[[watch_folders]]
path = "/media/incoming"
profile = "missing"
"#;
        let config = Config::parse_toml(toml_str).expect("Valid TOML");
        let err = config.validate().expect_err("unknown profile must be rejected");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = Config::parse_toml("[worker]\nqueue_capacity = 0\n").expect("Valid TOML");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_watch_folder_defaults() {
        let toml_str = r#"
[[watch_folders]]
path = "/media/tv"
profile = "Balanced"
"#;
        let config = Config::parse_toml(toml_str).expect("Valid TOML");
        config.validate().expect("display name is a valid reference");

        let folder = &config.watch_folders[0];
        assert!(folder.recursive);
        assert!(folder.extensions.contains(&".mkv".to_string()));
        assert!(folder.output_path.is_none());
    }

    #[test]
    fn test_env_override_ignores_garbage() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml("").expect("Valid TOML");
        env::set_var("RECODEX_QUEUE_CAPACITY", "lots");
        env::set_var("RECODEX_DRY_RUN", "maybe");
        env::set_var("RECODEX_STATE_DIR", "/var/lib/recodex");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.worker.queue_capacity, 256);
        assert!(!config.worker.dry_run);
        assert_eq!(config.worker.state_dir, PathBuf::from("/var/lib/recodex"));
    }

    #[test]
    fn test_default_toml_round_trips() {
        let rendered = Config::default_toml().expect("default config renders");
        let parsed = Config::parse_toml(&rendered).expect("rendered config parses");

        assert_eq!(parsed, Config::parse_toml("").expect("Valid TOML"));
        assert!(parsed.profiles.contains_key("archive"));
        parsed.validate().expect("default config is valid");
    }

    #[test]
    fn test_write_default_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("recodex.toml");

        Config::write_default(&path, false).expect("first write");
        let loaded = Config::load_from_file(&path).expect("written config loads");
        assert_eq!(loaded.worker.queue_capacity, 256);

        fs::write(&path, "[worker]\nqueue_capacity = 4\n").expect("edit config");
        let err = Config::write_default(&path, false).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert_eq!(
            Config::load_from_file(&path).expect("edited config").worker.queue_capacity,
            4
        );

        Config::write_default(&path, true).expect("forced write");
        assert_eq!(
            Config::load_from_file(&path).expect("reset config").worker.queue_capacity,
            256
        );
    }
}
