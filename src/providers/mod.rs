//! Provider module for Threadline
//!
//! This module contains the fragment source abstraction and its
//! implementations: a streaming Ollama client and a scripted source.

pub mod base;
pub mod ollama;
pub mod scripted;

pub use base::{FragmentStream, Prompt, Provider};
pub use ollama::OllamaProvider;
pub use scripted::{ScriptEnd, ScriptedProvider};

use crate::config::ProviderConfig;
use crate::error::{Result, ThreadlineError};
use std::sync::Arc;

/// Create a provider instance based on configuration
///
/// # Errors
///
/// Returns error if provider type is invalid or initialization fails
///
/// # Examples
///
/// ```
/// use threadline::config::ProviderConfig;
/// use threadline::providers::create_provider;
///
/// let mut config = ProviderConfig::default();
/// config.provider_type = "scripted".to_string();
/// let provider = create_provider(&config).unwrap();
/// assert_eq!(provider.name(), "scripted");
/// ```
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    match config.provider_type.as_str() {
        "ollama" => Ok(Arc::new(OllamaProvider::new(config.ollama.clone())?)),
        "scripted" => Ok(Arc::new(ScriptedProvider::from_config(&config.scripted))),
        other => Err(ThreadlineError::Config(format!("Unknown provider type: {}", other)).into()),
    }
}
