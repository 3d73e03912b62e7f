//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

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

/// Scheduling priority hint applied to the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessPriority {
    Realtime,
    High,
    AboveNormal,
    Normal,
    BelowNormal,
    Low,
}

impl ProcessPriority {
    /// Unix niceness equivalent of this priority.
    ///
    /// Negative values need elevated privileges. Without them `nice` warns
    /// and runs the engine at the default priority.
    pub fn niceness(&self) -> i32 {
        match self {
            ProcessPriority::Realtime => -20,
            ProcessPriority::High => -10,
            ProcessPriority::AboveNormal => -5,
            ProcessPriority::Normal => 0,
            ProcessPriority::BelowNormal => 5,
            ProcessPriority::Low => 15,
        }
    }
}

impl Default for ProcessPriority {
    fn default() -> Self {
        Self::BelowNormal
    }
}

impl FromStr for ProcessPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "realtime" => Ok(ProcessPriority::Realtime),
            "high" => Ok(ProcessPriority::High),
            "above_normal" => Ok(ProcessPriority::AboveNormal),
            "normal" => Ok(ProcessPriority::Normal),
            "below_normal" => Ok(ProcessPriority::BelowNormal),
            "low" => Ok(ProcessPriority::Low),
            other => Err(format!("unknown process priority '{}'", other)),
        }
    }
}

/// Queue-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Directory holding the crash-recovery snapshots
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Purge jobs from the queue as soon as they complete
    #[serde(default)]
    pub remove_completed_jobs: bool,
    /// Check free space at the destination before each job (default true)
    #[serde(default = "default_check_disk_space")]
    pub check_disk_space: bool,
    /// Minimum free space in MiB required at the destination
    #[serde(default = "default_min_free_disk_mb")]
    pub min_free_disk_mb: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_check_disk_space() -> bool {
    true
}

fn default_min_free_disk_mb() -> u64 {
    2048
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            remove_completed_jobs: false,
            check_disk_space: default_check_disk_space(),
            min_free_disk_mb: default_min_free_disk_mb(),
        }
    }
}

/// Encode engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Engine executable (looked up on PATH when not absolute)
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Priority hint for the engine process
    #[serde(default)]
    pub process_priority: ProcessPriority,
    /// Write a per-job encode log (default true)
    #[serde(default = "default_logging_enabled")]
    pub logging_enabled: bool,
    /// Directory for per-job encode logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Log size in MiB beyond which the encode is treated as runaway
    #[serde(default = "default_log_ceiling_mb")]
    pub log_ceiling_mb: u64,
}

fn default_executable() -> String {
    "HandBrakeCLI".to_string()
}

fn default_logging_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_ceiling_mb() -> u64 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            process_priority: ProcessPriority::default(),
            logging_enabled: default_logging_enabled(),
            log_dir: default_log_dir(),
            log_ceiling_mb: default_log_ceiling_mb(),
        }
    }
}

impl EngineConfig {
    /// Log ceiling in bytes
    pub fn log_ceiling_bytes(&self) -> u64 {
        self.log_ceiling_mb.saturating_mul(1024 * 1024)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn parse_bool(val: &str) -> Option<bool> {
    // Accept "true", "1", "yes" as true; "false", "0", "no" as false
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
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
    /// - QUEUE_STATE_DIR -> queue.state_dir
    /// - QUEUE_REMOVE_COMPLETED -> queue.remove_completed_jobs
    /// - QUEUE_CHECK_DISK_SPACE -> queue.check_disk_space
    /// - QUEUE_MIN_FREE_DISK_MB -> queue.min_free_disk_mb
    /// - ENGINE_EXECUTABLE -> engine.executable
    /// - ENGINE_PROCESS_PRIORITY -> engine.process_priority
    /// - ENGINE_LOGGING_ENABLED -> engine.logging_enabled
    /// - ENGINE_LOG_DIR -> engine.log_dir
    /// - ENGINE_LOG_CEILING_MB -> engine.log_ceiling_mb
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("QUEUE_STATE_DIR") {
            if !val.is_empty() {
                self.queue.state_dir = PathBuf::from(val);
            }
        }

        if let Some(flag) = env::var("QUEUE_REMOVE_COMPLETED").ok().as_deref().and_then(parse_bool) {
            self.queue.remove_completed_jobs = flag;
        }

        if let Some(flag) = env::var("QUEUE_CHECK_DISK_SPACE").ok().as_deref().and_then(parse_bool) {
            self.queue.check_disk_space = flag;
        }

        if let Ok(val) = env::var("QUEUE_MIN_FREE_DISK_MB") {
            if let Ok(mb) = val.parse::<u64>() {
                self.queue.min_free_disk_mb = mb;
            }
        }

        if let Ok(val) = env::var("ENGINE_EXECUTABLE") {
            if !val.is_empty() {
                self.engine.executable = val;
            }
        }

        if let Ok(val) = env::var("ENGINE_PROCESS_PRIORITY") {
            if let Ok(priority) = val.parse::<ProcessPriority>() {
                self.engine.process_priority = priority;
            }
        }

        if let Some(flag) = env::var("ENGINE_LOGGING_ENABLED").ok().as_deref().and_then(parse_bool) {
            self.engine.logging_enabled = flag;
        }

        if let Ok(val) = env::var("ENGINE_LOG_DIR") {
            if !val.is_empty() {
                self.engine.log_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("ENGINE_LOG_CEILING_MB") {
            if let Ok(mb) = val.parse::<u64>() {
                self.engine.log_ceiling_mb = mb;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
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
        for name in [
            "QUEUE_STATE_DIR",
            "QUEUE_REMOVE_COMPLETED",
            "QUEUE_CHECK_DISK_SPACE",
            "QUEUE_MIN_FREE_DISK_MB",
            "ENGINE_EXECUTABLE",
            "ENGINE_PROCESS_PRIORITY",
            "ENGINE_LOGGING_ENABLED",
            "ENGINE_LOG_DIR",
            "ENGINE_LOG_CEILING_MB",
        ] {
            env::remove_var(name);
        }
    }

    fn priority_strategy() -> impl Strategy<Value = ProcessPriority> {
        prop_oneof![
            Just(ProcessPriority::Realtime),
            Just(ProcessPriority::High),
            Just(ProcessPriority::AboveNormal),
            Just(ProcessPriority::Normal),
            Just(ProcessPriority::BelowNormal),
            Just(ProcessPriority::Low),
        ]
    }

    fn priority_name(p: ProcessPriority) -> &'static str {
        match p {
            ProcessPriority::Realtime => "realtime",
            ProcessPriority::High => "high",
            ProcessPriority::AboveNormal => "above_normal",
            ProcessPriority::Normal => "normal",
            ProcessPriority::BelowNormal => "below_normal",
            ProcessPriority::Low => "low",
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            remove_completed in proptest::bool::ANY,
            check_disk in proptest::bool::ANY,
            min_free in 0u64..1_000_000,
            priority in priority_strategy(),
            logging in proptest::bool::ANY,
            ceiling in 1u64..1024,
        ) {
            let toml_str = format!(
                r#"
[queue]
state_dir = "/var/lib/encode-queue"
remove_completed_jobs = {}
check_disk_space = {}
min_free_disk_mb = {}

[engine]
executable = "/usr/bin/HandBrakeCLI"
process_priority = "{}"
logging_enabled = {}
log_dir = "/var/log/encode-queue"
log_ceiling_mb = {}
"#,
                remove_completed, check_disk, min_free,
                priority_name(priority), logging, ceiling
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(&config.queue.state_dir, &PathBuf::from("/var/lib/encode-queue"));
            prop_assert_eq!(config.queue.remove_completed_jobs, remove_completed);
            prop_assert_eq!(config.queue.check_disk_space, check_disk);
            prop_assert_eq!(config.queue.min_free_disk_mb, min_free);
            prop_assert_eq!(&config.engine.executable, "/usr/bin/HandBrakeCLI");
            prop_assert_eq!(config.engine.process_priority, priority);
            prop_assert_eq!(config.engine.logging_enabled, logging);
            prop_assert_eq!(config.engine.log_ceiling_mb, ceiling);
        }

        #[test]
        fn prop_env_overrides_min_free_disk(
            initial in 0u64..10_000,
            override_mb in 0u64..1_000_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[queue]\nmin_free_disk_mb = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("QUEUE_MIN_FREE_DISK_MB", override_mb.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.queue.min_free_disk_mb, override_mb);
        }

        #[test]
        fn prop_env_overrides_priority(
            initial in priority_strategy(),
            override_priority in priority_strategy(),
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[engine]\nprocess_priority = \"{}\"\n", priority_name(initial));
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("ENGINE_PROCESS_PRIORITY", priority_name(override_priority));
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.engine.process_priority, override_priority);
        }

        #[test]
        fn prop_env_overrides_remove_completed(
            initial in proptest::bool::ANY,
            override_flag in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[queue]\nremove_completed_jobs = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("QUEUE_REMOVE_COMPLETED", override_flag.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.queue.remove_completed_jobs, override_flag);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.queue.state_dir, PathBuf::from("state"));
        assert!(!config.queue.remove_completed_jobs);
        assert!(config.queue.check_disk_space);
        assert_eq!(config.queue.min_free_disk_mb, 2048);
        assert_eq!(config.engine.executable, "HandBrakeCLI");
        assert_eq!(config.engine.process_priority, ProcessPriority::BelowNormal);
        assert!(config.engine.logging_enabled);
        assert_eq!(config.engine.log_ceiling_bytes(), 50 * 1024 * 1024);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[engine]
executable = "ffmpeg-wrapper"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.engine.executable, "ffmpeg-wrapper");
        assert_eq!(config.engine.log_ceiling_mb, 50); // default
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("QUEUE_CHECK_DISK_SPACE", "maybe");
        env::set_var("ENGINE_PROCESS_PRIORITY", "urgent");
        env::set_var("ENGINE_LOG_CEILING_MB", "lots");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_priority_from_str_accepts_dashes() {
        assert_eq!("Below-Normal".parse::<ProcessPriority>(), Ok(ProcessPriority::BelowNormal));
        assert!("fastest".parse::<ProcessPriority>().is_err());
        assert_eq!(ProcessPriority::Normal.niceness(), 0);
        assert!(ProcessPriority::Low.niceness() > ProcessPriority::BelowNormal.niceness());
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = Config::parse_toml("[queue]\nmin_free_disk_mb = \"lots\"\n").unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse config"));
    }
}
