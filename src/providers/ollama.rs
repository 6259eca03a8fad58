//! Ollama provider implementation for Threadline
//!
//! Streams completions from Ollama's `/api/generate` endpoint, which answers
//! with newline-delimited JSON objects carrying one fragment each. Dropping
//! the response body closes the connection, which is how a cancelled
//! generation is stopped on the server side.

use crate::config::OllamaConfig;
use crate::error::{Result, ThreadlineError};
use crate::providers::{FragmentStream, Prompt, Provider};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// Ollama API provider
///
/// # Examples
///
/// ```no_run
/// use threadline::config::OllamaConfig;
/// use threadline::providers::{OllamaProvider, Prompt, Provider};
///
/// # async fn example() -> threadline::error::Result<()> {
/// let provider = OllamaProvider::new(OllamaConfig::default())?;
/// let answer = provider.complete(&Prompt::new("User: Hello!\nAssistant:")).await?;
/// # Ok(())
/// # }
/// ```
pub struct OllamaProvider {
    client: Client,
    config: OllamaConfig,
    timeout: Duration,
}

/// Request body for `/api/generate`
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
}

/// One line of a streamed `/api/generate` response
#[derive(Debug, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaProvider {
    /// Create a new Ollama provider instance
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails
    ///
    /// # Examples
    ///
    /// ```
    /// use threadline::config::OllamaConfig;
    /// use threadline::providers::OllamaProvider;
    ///
    /// let provider = OllamaProvider::new(OllamaConfig::default());
    /// assert!(provider.is_ok());
    /// ```
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("threadline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ThreadlineError::Generation(format!("Failed to create HTTP client: {}", e))
            })?;

        tracing::info!(
            "Initialized Ollama provider: host={}, model={}",
            config.host,
            config.model
        );

        let timeout = Duration::from_secs(config.timeout_seconds);
        Ok(Self {
            client,
            config,
            timeout,
        })
    }

    /// Override the per-generation time limit
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the configured Ollama host
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Get the configured model name
    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.config.host.trim_end_matches('/'))
    }

    fn timeout_error(&self) -> ThreadlineError {
        ThreadlineError::GenerationTimeout(format!(
            "Ollama did not finish within {}s",
            self.timeout.as_secs_f64()
        ))
    }

    async fn send(&self, prompt: &Prompt, stream: bool) -> Result<reqwest::Response> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt: &prompt.text,
            system: prompt.system.as_deref(),
            stream,
        };

        tracing::debug!(
            model = %self.config.model,
            prompt_chars = prompt.text.len(),
            stream,
            "Sending Ollama request"
        );

        let response = self
            .client
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Ollama request failed: {}", e);
                if e.is_timeout() {
                    self.timeout_error()
                } else {
                    ThreadlineError::Generation(format!("Ollama request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!("Ollama returned error {}: {}", status, error_text);
            return Err(ThreadlineError::Generation(format!(
                "Ollama returned error {}: {}",
                status, error_text
            ))
            .into());
        }

        Ok(response)
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn stream(&self, prompt: &Prompt, cancel: CancellationToken) -> Result<FragmentStream> {
        let deadline = Instant::now() + self.timeout;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ThreadlineError::Cancelled.into()),
            _ = tokio::time::sleep_until(deadline) => return Err(self.timeout_error().into()),
            response = self.send(prompt, true) => response?,
        };

        let (tx, rx) = mpsc::unbounded_channel::<Result<String>>();
        let timeout_error = self.timeout_error().to_string();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = NdjsonDecoder::default();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!("Ollama stream cancelled, closing connection");
                        let _ = tx.send(Err(ThreadlineError::Cancelled.into()));
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        let _ = tx.send(Err(ThreadlineError::GenerationTimeout(timeout_error.clone()).into()));
                        return;
                    }
                    next = body.next() => next,
                };

                let exhausted = next.is_none();
                let lines = match next {
                    Some(Ok(bytes)) => decoder.push(&bytes),
                    Some(Err(e)) => {
                        let _ = tx.send(Err(ThreadlineError::Generation(format!(
                            "Ollama stream failed: {}",
                            e
                        ))
                        .into()));
                        return;
                    }
                    None => decoder.finish().into_iter().collect(),
                };

                for line in lines {
                    match parse_line(&line) {
                        Ok(parsed) => {
                            if !parsed.response.is_empty() && tx.send(Ok(parsed.response)).is_err()
                            {
                                return;
                            }
                            if parsed.done {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                }

                if exhausted || tx.is_closed() {
                    return;
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        let response = tokio::time::timeout(self.timeout, async {
            let response = self.send(prompt, false).await?;
            let body = response.text().await.map_err(|e| {
                ThreadlineError::Generation(format!("Failed to read Ollama response: {}", e))
            })?;
            parse_line(&body)
        })
        .await
        .map_err(|_| self.timeout_error())??;

        Ok(response.response)
    }
}

fn parse_line(line: &str) -> Result<GenerateLine> {
    let parsed: GenerateLine = serde_json::from_str(line).map_err(|e| {
        tracing::error!("Failed to parse Ollama response line: {}", e);
        ThreadlineError::Generation(format!("Failed to parse Ollama response: {}", e))
    })?;
    if let Some(error) = parsed.error {
        return Err(ThreadlineError::Generation(format!("Ollama error: {}", error)).into());
    }
    Ok(parsed)
}

/// Splits a byte stream into complete, non-empty lines
#[derive(Debug, Default)]
struct NdjsonDecoder {
    buffer: BytesMut,
}

impl NdjsonDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}
