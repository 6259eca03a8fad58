//! Configuration management for Threadline
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{Result, ThreadlineError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for Threadline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Database location
    #[serde(default)]
    pub storage: StorageConfig,
    /// Fragment source settings
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Generation behaviour
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Crash-recovery sweep
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Shared live views
    #[serde(default)]
    pub views: ViewsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the API listens on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Address for the Prometheus scrape endpoint (requires the `prometheus` feature)
    #[serde(default)]
    pub metrics_address: Option<String>,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            metrics_address: None,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file; the platform data directory is used when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Provider configuration
///
/// Specifies which fragment source to use and its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Type of provider to use
    #[serde(rename = "type", default = "default_provider_type")]
    pub provider_type: String,

    /// Ollama configuration
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// Scripted provider configuration
    #[serde(default)]
    pub scripted: ScriptedConfig,
}

fn default_provider_type() -> String {
    "ollama".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: default_provider_type(),
            ollama: OllamaConfig::default(),
            scripted: ScriptedConfig::default(),
        }
    }
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Ollama server host
    #[serde(default = "default_ollama_host")]
    pub host: String,

    /// Model to use for Ollama
    #[serde(default = "default_ollama_model")]
    pub model: String,

    /// Upper bound on one generation, surfaced as a timeout
    #[serde(default = "default_ollama_timeout")]
    pub timeout_seconds: u64,
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_timeout() -> u64 {
    120
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: default_ollama_host(),
            model: default_ollama_model(),
            timeout_seconds: default_ollama_timeout(),
        }
    }
}

/// Scripted provider configuration
///
/// Replays a fixed list of fragments; used for demos and offline testing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedConfig {
    /// Fragments emitted in order
    #[serde(default = "default_scripted_fragments")]
    pub fragments: Vec<String>,

    /// Pause before each fragment
    #[serde(default = "default_scripted_delay")]
    pub delay_ms: u64,

    /// Answer returned to title requests
    #[serde(default = "default_scripted_title")]
    pub title: String,
}

fn default_scripted_fragments() -> Vec<String> {
    ["Hello", "! ", "How ", "can ", "I ", "help?"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_scripted_delay() -> u64 {
    50
}

fn default_scripted_title() -> String {
    "Friendly Greeting".to_string()
}

impl Default for ScriptedConfig {
    fn default() -> Self {
        Self {
            fragments: default_scripted_fragments(),
            delay_ms: default_scripted_delay(),
            title: default_scripted_title(),
        }
    }
}

/// Generation behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// System instructions sent with every prompt
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Generate a title after the first answer of a conversation
    #[serde(default = "default_generate_titles")]
    pub generate_titles: bool,

    /// Generated titles are truncated to this many characters
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
}

fn default_system_prompt() -> String {
    crate::prompts::DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_generate_titles() -> bool {
    true
}

fn default_title_max_chars() -> usize {
    60
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            generate_titles: default_generate_titles(),
            title_max_chars: default_title_max_chars(),
        }
    }
}

/// Crash-recovery sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Finalize every orphaned message before serving
    #[serde(default = "default_sweep_on_startup")]
    pub sweep_on_startup: bool,

    /// Seconds between periodic sweeps
    #[serde(default = "default_recovery_interval")]
    pub interval_seconds: u64,

    /// Messages touched more recently than this are left alone
    #[serde(default = "default_recovery_grace")]
    pub grace_seconds: u64,
}

fn default_sweep_on_startup() -> bool {
    true
}

fn default_recovery_interval() -> u64 {
    60
}

fn default_recovery_grace() -> u64 {
    30
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_on_startup: default_sweep_on_startup(),
            interval_seconds: default_recovery_interval(),
            grace_seconds: default_recovery_grace(),
        }
    }
}

impl RecoveryConfig {
    /// Sweep period
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Minimum age of a message before a periodic sweep finalizes it
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

/// Shared live view configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewsConfig {
    /// How long a view stays materialized after its last subscriber leaves
    #[serde(default = "default_view_ttl")]
    pub ttl_seconds: u64,
}

fn default_view_ttl() -> u64 {
    5
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_view_ttl(),
        }
    }
}

impl ViewsConfig {
    /// Teardown delay for unused views
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ThreadlineError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ThreadlineError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(bind) = std::env::var("THREADLINE_BIND_ADDRESS") {
            self.server.bind_address = bind;
        }

        if let Ok(db) = std::env::var("THREADLINE_DB") {
            self.storage.path = Some(PathBuf::from(db));
        }

        if let Ok(provider_type) = std::env::var("THREADLINE_PROVIDER") {
            self.provider.provider_type = provider_type;
        }

        if let Ok(ollama_host) = std::env::var("THREADLINE_OLLAMA_HOST") {
            self.provider.ollama.host = ollama_host;
        }

        if let Ok(ollama_model) = std::env::var("THREADLINE_OLLAMA_MODEL") {
            self.provider.ollama.model = ollama_model;
        }

        if let Ok(interval) = std::env::var("THREADLINE_RECOVERY_INTERVAL_SECONDS") {
            if let Ok(value) = interval.parse() {
                self.recovery.interval_seconds = value;
            } else {
                tracing::warn!("Invalid THREADLINE_RECOVERY_INTERVAL_SECONDS: {}", interval);
            }
        }

        if let Ok(ttl) = std::env::var("THREADLINE_VIEW_TTL_SECONDS") {
            if let Ok(value) = ttl.parse() {
                self.views.ttl_seconds = value;
            } else {
                tracing::warn!("Invalid THREADLINE_VIEW_TTL_SECONDS: {}", ttl);
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(path) = &cli.storage_path {
            tracing::info!("Using storage path override from CLI: {}", path);
            self.storage.path = Some(PathBuf::from(path));
        }

        if let crate::cli::Commands::Serve { bind: Some(bind) } = &cli.command {
            self.server.bind_address = bind.clone();
        }

        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }
    }

    /// Parsed server bind address
    pub fn bind_address(&self) -> Result<SocketAddr> {
        self.server.bind_address.parse().map_err(|e| {
            ThreadlineError::Config(format!(
                "Invalid bind address '{}': {}",
                self.server.bind_address, e
            ))
            .into()
        })
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let valid_providers = ["ollama", "scripted"];
        if !valid_providers.contains(&self.provider.provider_type.as_str()) {
            return Err(ThreadlineError::Config(format!(
                "Invalid provider type: {}. Must be one of: {}",
                self.provider.provider_type,
                valid_providers.join(", ")
            ))
            .into());
        }

        if self.provider.provider_type == "ollama" {
            if self.provider.ollama.host.trim().is_empty() {
                return Err(
                    ThreadlineError::Config("provider.ollama.host cannot be empty".into()).into(),
                );
            }
            if self.provider.ollama.model.trim().is_empty() {
                return Err(
                    ThreadlineError::Config("provider.ollama.model cannot be empty".into()).into(),
                );
            }
            if self.provider.ollama.timeout_seconds == 0 {
                return Err(ThreadlineError::Config(
                    "provider.ollama.timeout_seconds must be greater than 0".into(),
                )
                .into());
            }
        }

        if self.recovery.interval_seconds == 0 {
            return Err(ThreadlineError::Config(
                "recovery.interval_seconds must be greater than 0".into(),
            )
            .into());
        }

        if self.generation.title_max_chars == 0 {
            return Err(ThreadlineError::Config(
                "generation.title_max_chars must be greater than 0".into(),
            )
            .into());
        }

        self.bind_address()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "THREADLINE_BIND_ADDRESS",
            "THREADLINE_DB",
            "THREADLINE_PROVIDER",
            "THREADLINE_OLLAMA_HOST",
            "THREADLINE_OLLAMA_MODEL",
            "THREADLINE_RECOVERY_INTERVAL_SECONDS",
            "THREADLINE_VIEW_TTL_SECONDS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.provider.provider_type, "ollama");
        assert_eq!(config.server.bind_address, "127.0.0.1:8080");
        assert_eq!(config.recovery.interval_seconds, 60);
        assert_eq!(config.views.ttl_seconds, 5);
        assert!(config.generation.generate_titles);
    }

    #[test]
    fn test_config_validation_success() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_provider() {
        let mut config = Config::default();
        config.provider.provider_type = "copilot".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_model() {
        let mut config = Config::default();
        config.provider.ollama.model = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_scripted_ignores_ollama_settings() {
        let mut config = Config::default();
        config.provider.provider_type = "scripted".to_string();
        config.provider.ollama.model = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_interval() {
        let mut config = Config::default();
        config.recovery.interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_bind_address() {
        let mut config = Config::default();
        config.server.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
server:
  bind_address: "0.0.0.0:3000"
provider:
  type: scripted
  scripted:
    fragments: ["a", "b"]
    delay_ms: 0
recovery:
  grace_seconds: 10
views:
  ttl_seconds: 2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:3000");
        assert_eq!(config.provider.provider_type, "scripted");
        assert_eq!(config.provider.scripted.fragments, vec!["a", "b"]);
        assert_eq!(config.provider.scripted.title, "Friendly Greeting");
        assert_eq!(config.recovery.grace(), Duration::from_secs(10));
        assert_eq!(config.recovery.interval_seconds, 60);
        assert_eq!(config.views.ttl(), Duration::from_secs(2));
    }

    #[test]
    #[serial]
    fn test_load_nonexistent_file_uses_defaults() {
        clear_env();
        let config = Config::load("nonexistent.yaml", &crate::cli::Cli::default()).unwrap();
        assert_eq!(config.provider.provider_type, "ollama");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("THREADLINE_PROVIDER", "scripted");
        std::env::set_var("THREADLINE_DB", "/tmp/env.db");
        std::env::set_var("THREADLINE_VIEW_TTL_SECONDS", "9");
        std::env::set_var("THREADLINE_RECOVERY_INTERVAL_SECONDS", "soon");

        let config = Config::load("nonexistent.yaml", &crate::cli::Cli::default()).unwrap();
        clear_env();

        assert_eq!(config.provider.provider_type, "scripted");
        assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/env.db")));
        assert_eq!(config.views.ttl_seconds, 9);
        assert_eq!(config.recovery.interval_seconds, 60);
    }

    #[test]
    #[serial]
    fn test_cli_overrides_win_over_env() {
        clear_env();
        std::env::set_var("THREADLINE_DB", "/tmp/env.db");
        std::env::set_var("THREADLINE_BIND_ADDRESS", "127.0.0.1:1");
        let cli = crate::cli::Cli {
            storage_path: Some("/tmp/cli.db".to_string()),
            command: crate::cli::Commands::Serve {
                bind: Some("127.0.0.1:2".to_string()),
            },
            ..crate::cli::Cli::default()
        };

        let config = Config::load("nonexistent.yaml", &cli).unwrap();
        clear_env();

        assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/cli.db")));
        assert_eq!(config.server.bind_address, "127.0.0.1:2");
    }
}
