//! Base provider trait and common types for Threadline
//!
//! A provider is the external generator: given a formatted prompt and a
//! cancellation token it produces a stream of text fragments. Providers must
//! honour the token between fragments and surface their own time limits as
//! [`ThreadlineError::GenerationTimeout`](crate::error::ThreadlineError).

use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Stream of generated fragments
///
/// Ends normally when generation completes; yields an error on failure,
/// on cancellation or on timeout.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Formatted prompt sent to a provider
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Prompt {
    /// Optional system instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Prompt body
    pub text: String,
}

impl Prompt {
    /// Creates a prompt without system instructions
    ///
    /// # Examples
    ///
    /// ```
    /// use threadline::providers::Prompt;
    ///
    /// let prompt = Prompt::new("User: hi\nAssistant:");
    /// assert!(prompt.system.is_none());
    /// ```
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            system: None,
            text: text.into(),
        }
    }

    /// Attaches system instructions; blank instructions are dropped
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        let system = system.into();
        self.system = if system.trim().is_empty() {
            None
        } else {
            Some(system)
        };
        self
    }
}

/// Provider trait for fragment sources
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use threadline::error::Result;
/// use threadline::providers::{FragmentStream, Prompt, Provider};
/// use tokio_util::sync::CancellationToken;
///
/// struct Echo;
///
/// #[async_trait]
/// impl Provider for Echo {
///     fn name(&self) -> &str {
///         "echo"
///     }
///
///     async fn stream(&self, prompt: &Prompt, _cancel: CancellationToken) -> Result<FragmentStream> {
///         let text = prompt.text.clone();
///         Ok(Box::pin(futures::stream::iter(vec![Ok(text)])))
///     }
/// }
/// ```
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name used in logs
    fn name(&self) -> &str;

    /// Starts generating fragments for `prompt`
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started. Failures after the
    /// first fragment are yielded by the stream itself.
    async fn stream(&self, prompt: &Prompt, cancel: CancellationToken) -> Result<FragmentStream>;

    /// Generates a complete answer without streaming it
    ///
    /// The default implementation drains [`Provider::stream`] with a token
    /// nobody cancels.
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        use futures::StreamExt;

        let mut fragments = self.stream(prompt, CancellationToken::new()).await?;
        let mut text = String::new();
        while let Some(fragment) = fragments.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThreadlineError;

    struct FixedProvider {
        fragments: Vec<&'static str>,
        fail_at_end: bool,
    }

    #[async_trait]
    impl Provider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn stream(
            &self,
            _prompt: &Prompt,
            _cancel: CancellationToken,
        ) -> Result<FragmentStream> {
            let mut items: Vec<Result<String>> = self
                .fragments
                .iter()
                .map(|f| Ok(f.to_string()))
                .collect();
            if self.fail_at_end {
                items.push(Err(ThreadlineError::Generation("boom".into()).into()));
            }
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    #[test]
    fn test_prompt_with_blank_system_is_dropped() {
        let prompt = Prompt::new("hi").with_system("   ");
        assert!(prompt.system.is_none());
        let prompt = Prompt::new("hi").with_system("be brief");
        assert_eq!(prompt.system.as_deref(), Some("be brief"));
    }

    #[test]
    fn test_prompt_serialization_skips_missing_system() {
        let json = serde_json::to_string(&Prompt::new("x")).unwrap();
        assert_eq!(json, r#"{"text":"x"}"#);
    }

    #[tokio::test]
    async fn test_default_complete_concatenates_fragments() {
        let provider = FixedProvider {
            fragments: vec!["Hel", "lo"],
            fail_at_end: false,
        };
        let text = provider.complete(&Prompt::new("p")).await.unwrap();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn test_default_complete_propagates_failure() {
        let provider = FixedProvider {
            fragments: vec!["partial"],
            fail_at_end: true,
        };
        assert!(provider.complete(&Prompt::new("p")).await.is_err());
    }
}
