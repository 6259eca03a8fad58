//! Scripted provider
//!
//! Replays a fixed list of fragments with an optional pause between them and
//! then ends the way it was told to. Used by `provider.type: scripted` for
//! offline demos and throughout the test suite.

use crate::config::ScriptedConfig;
use crate::error::{Result, ThreadlineError};
use crate::providers::{FragmentStream, Prompt, Provider};

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What happens after the last scripted fragment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScriptEnd {
    /// Stream ends normally
    #[default]
    Finish,
    /// Stream stays open until cancelled, then reports cancellation
    Hold,
    /// Stream fails with a generation error
    Fail(String),
    /// Stream reports its own time limit
    Timeout,
}

/// Provider that emits a predetermined sequence of fragments
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    fragments: Arc<Vec<String>>,
    delay: Duration,
    end: ScriptEnd,
    title: Option<String>,
    stream_calls: Arc<AtomicUsize>,
    complete_calls: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<Prompt>>>,
}

impl ScriptedProvider {
    /// Creates a provider that emits `fragments` without pausing
    ///
    /// # Examples
    ///
    /// ```
    /// use threadline::providers::{Provider, ScriptedProvider};
    ///
    /// let provider = ScriptedProvider::new(["Hel", "lo"]);
    /// assert_eq!(provider.name(), "scripted");
    /// assert_eq!(provider.stream_calls(), 0);
    /// ```
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: Arc::new(fragments.into_iter().map(Into::into).collect()),
            delay: Duration::ZERO,
            end: ScriptEnd::Finish,
            title: None,
            stream_calls: Arc::new(AtomicUsize::new(0)),
            complete_calls: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Builds a provider from the `provider.scripted` configuration section
    pub fn from_config(config: &ScriptedConfig) -> Self {
        Self::new(config.fragments.iter().cloned())
            .with_delay(Duration::from_millis(config.delay_ms))
            .with_title(config.title.clone())
    }

    /// Pause before each fragment
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// How the stream ends after the last fragment
    pub fn with_end(mut self, end: ScriptEnd) -> Self {
        self.end = end;
        self
    }

    /// Answer returned by [`Provider::complete`]; without one it fails
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Number of streams started
    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Number of non-streaming completions requested
    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, in order
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }

    fn record(&self, prompt: &Prompt) {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
    }
}

struct ScriptState {
    fragments: Arc<Vec<String>>,
    next: usize,
    delay: Duration,
    end: ScriptEnd,
    cancel: CancellationToken,
    finished: bool,
}

async fn next_fragment(mut state: ScriptState) -> Option<(Result<String>, ScriptState)> {
    if state.finished {
        return None;
    }

    if state.next < state.fragments.len() {
        if !state.delay.is_zero() {
            tokio::select! {
                biased;
                _ = state.cancel.cancelled() => {}
                _ = tokio::time::sleep(state.delay) => {}
            }
        }
        if state.cancel.is_cancelled() {
            state.finished = true;
            return Some((Err(ThreadlineError::Cancelled.into()), state));
        }
        let fragment = state.fragments[state.next].clone();
        state.next += 1;
        return Some((Ok(fragment), state));
    }

    state.finished = true;
    let err = match &state.end {
        ScriptEnd::Finish => return None,
        ScriptEnd::Hold => {
            state.cancel.cancelled().await;
            ThreadlineError::Cancelled
        }
        ScriptEnd::Fail(message) => ThreadlineError::Generation(message.clone()),
        ScriptEnd::Timeout => {
            ThreadlineError::GenerationTimeout("scripted provider time limit".to_string())
        }
    };
    Some((Err(err.into()), state))
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, prompt: &Prompt, cancel: CancellationToken) -> Result<FragmentStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.record(prompt);

        let state = ScriptState {
            fragments: Arc::clone(&self.fragments),
            next: 0,
            delay: self.delay,
            end: self.end.clone(),
            cancel,
            finished: false,
        };
        Ok(Box::pin(futures::stream::unfold(state, next_fragment)))
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.record(prompt);
        self.title.clone().ok_or_else(|| {
            ThreadlineError::Generation("no scripted completion configured".to_string()).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{is_interruption, is_timeout};
    use futures::StreamExt;

    async fn drain(mut stream: FragmentStream) -> (String, Option<anyhow::Error>) {
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => text.push_str(&fragment),
                Err(e) => return (text, Some(e)),
            }
        }
        (text, None)
    }

    #[tokio::test]
    async fn test_finish_emits_all_fragments() {
        let provider = ScriptedProvider::new(["a", "b", "c"]);
        let stream = provider
            .stream(&Prompt::new("p"), CancellationToken::new())
            .await
            .unwrap();
        let (text, err) = drain(stream).await;
        assert_eq!(text, "abc");
        assert!(err.is_none());
        assert_eq!(provider.stream_calls(), 1);
    }

    #[tokio::test]
    async fn test_hold_waits_for_cancellation() {
        let provider = ScriptedProvider::new(["Hel", "lo"]).with_end(ScriptEnd::Hold);
        let cancel = CancellationToken::new();
        let mut stream = provider
            .stream(&Prompt::new("p"), cancel.clone())
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), "Hel");
        assert_eq!(stream.next().await.unwrap().unwrap(), "lo");
        cancel.cancel();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(is_interruption(&err));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_between_fragments() {
        let provider = ScriptedProvider::new(["a", "b"]).with_delay(Duration::from_millis(20));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream = provider.stream(&Prompt::new("p"), cancel).await.unwrap();
        let (text, err) = drain(stream).await;
        assert_eq!(text, "");
        assert!(is_interruption(&err.unwrap()));
    }

    #[tokio::test]
    async fn test_fail_and_timeout_endings() {
        let failing = ScriptedProvider::new(["x"]).with_end(ScriptEnd::Fail("bad".into()));
        let stream = failing
            .stream(&Prompt::new("p"), CancellationToken::new())
            .await
            .unwrap();
        let (text, err) = drain(stream).await;
        assert_eq!(text, "x");
        assert!(!is_interruption(&err.unwrap()));

        let slow = ScriptedProvider::new(["y"]).with_end(ScriptEnd::Timeout);
        let stream = slow
            .stream(&Prompt::new("p"), CancellationToken::new())
            .await
            .unwrap();
        let (_, err) = drain(stream).await;
        assert!(is_timeout(&err.unwrap()));
    }

    #[tokio::test]
    async fn test_complete_returns_title_and_records_prompt() {
        let provider = ScriptedProvider::new(Vec::<String>::new()).with_title("Rust Basics");
        let title = provider.complete(&Prompt::new("title?")).await.unwrap();
        assert_eq!(title, "Rust Basics");
        assert_eq!(provider.complete_calls(), 1);
        assert_eq!(provider.prompts()[0].text, "title?");

        let untitled = ScriptedProvider::new(["a"]);
        assert!(untitled.complete(&Prompt::new("t")).await.is_err());
    }

    #[test]
    fn test_from_config() {
        let provider = ScriptedProvider::from_config(&ScriptedConfig::default());
        assert_eq!(provider.fragments.len(), 6);
        assert_eq!(provider.title.as_deref(), Some("Friendly Greeting"));
    }
}
