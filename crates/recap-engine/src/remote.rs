//! HTTP implementations of the provider traits.
//!
//! Each provider is an opaque JSON request/response endpoint; prompts,
//! voice ids and model choices live server-side. Errors are classified
//! for the call gate: connection problems and timeouts are transient,
//! HTTP statuses carry their code so the per-provider retry policy can
//! decide.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use recap_gate::CallError;
use recap_models::{BillingNotice, BlobHandle};

use crate::billing::BillingSink;
use crate::providers::{
    AssemblyStep, ChapterProvider, ChapterSpan, DescribeRequest, MediaTranscoder,
    SpeechSynthesizer, SynthesizedAudio, TranscodeOutput, VisualDescriber,
};

/// Endpoint configuration shared by the HTTP providers.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Read `{PREFIX}_URL` and optional `{PREFIX}_API_KEY`.
    pub fn from_env(prefix: &str) -> Option<Self> {
        let base_url = std::env::var(format!("{prefix}_URL")).ok()?;
        Some(Self {
            base_url,
            api_key: std::env::var(format!("{prefix}_API_KEY")).ok(),
        })
    }
}

fn classify(error: reqwest::Error) -> CallError {
    if error.is_timeout() || error.is_connect() {
        CallError::transient(error.to_string())
    } else {
        CallError::permanent(error.to_string())
    }
}

async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
    client: &Client,
    config: &HttpProviderConfig,
    path: &str,
    body: &Req,
) -> Result<Resp, CallError> {
    let url = format!("{}{}", config.base_url.trim_end_matches('/'), path);
    let mut request = client.post(&url).json(body);
    if let Some(key) = &config.api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send().await.map_err(classify)?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(CallError::status(status.as_u16(), message));
    }

    response.json().await.map_err(classify)
}

// =============================================================================
// Chapter service
// =============================================================================

#[derive(Serialize)]
struct ChaptersRequest<'a> {
    source: &'a BlobHandle,
    duration_seconds: f64,
}

#[derive(Deserialize)]
struct ChaptersResponse {
    chapters: Vec<ChapterSpan>,
}

/// Chapter service over HTTP.
pub struct HttpChapterProvider {
    client: Client,
    config: HttpProviderConfig,
}

impl HttpChapterProvider {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ChapterProvider for HttpChapterProvider {
    async fn chapters(
        &self,
        source: &BlobHandle,
        duration_seconds: f64,
    ) -> Result<Vec<ChapterSpan>, CallError> {
        let response: ChaptersResponse = post_json(
            &self.client,
            &self.config,
            "/v1/chapters",
            &ChaptersRequest {
                source,
                duration_seconds,
            },
        )
        .await?;
        debug!(count = response.chapters.len(), "Fetched chapters");
        Ok(response.chapters)
    }
}

// =============================================================================
// Visual-understanding service
// =============================================================================

#[derive(Deserialize)]
struct DescribeResponse {
    narration: String,
}

/// Visual-understanding service over HTTP.
pub struct HttpVisualDescriber {
    client: Client,
    config: HttpProviderConfig,
}

impl HttpVisualDescriber {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl VisualDescriber for HttpVisualDescriber {
    async fn describe(&self, request: DescribeRequest<'_>) -> Result<String, CallError> {
        let response: DescribeResponse =
            post_json(&self.client, &self.config, "/v1/describe", &request).await?;
        Ok(response.narration)
    }
}

// =============================================================================
// Text-to-speech service
// =============================================================================

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct SynthesizeResponse {
    /// Base64-encoded audio bytes
    audio: String,
    #[serde(default = "default_audio_content_type")]
    content_type: String,
    duration_seconds: f64,
}

fn default_audio_content_type() -> String {
    "audio/mpeg".to_string()
}

/// Text-to-speech service over HTTP.
pub struct HttpSpeechSynthesizer {
    client: Client,
    config: HttpProviderConfig,
}

impl HttpSpeechSynthesizer {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, CallError> {
        let response: SynthesizeResponse =
            post_json(&self.client, &self.config, "/v1/synthesize", &SynthesizeRequest { text })
                .await?;

        let audio = BASE64
            .decode(&response.audio)
            .map_err(|e| CallError::permanent(format!("undecodable audio payload: {e}")))?;

        Ok(SynthesizedAudio {
            audio,
            content_type: response.content_type,
            duration_seconds: response.duration_seconds,
        })
    }
}

// =============================================================================
// Media transcoder
// =============================================================================

#[derive(Serialize)]
struct AssembleRequest<'a> {
    source: &'a BlobHandle,
    plan: &'a [AssemblyStep],
}

#[derive(Deserialize)]
struct AssembleResponse {
    output: String,
    duration_seconds: f64,
}

/// Media transcoder behind an HTTP job runner.
pub struct HttpMediaTranscoder {
    client: Client,
    config: HttpProviderConfig,
}

impl HttpMediaTranscoder {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl MediaTranscoder for HttpMediaTranscoder {
    async fn assemble(
        &self,
        source: &BlobHandle,
        plan: &[AssemblyStep],
    ) -> Result<TranscodeOutput, CallError> {
        let response: AssembleResponse = post_json(
            &self.client,
            &self.config,
            "/v1/assemble",
            &AssembleRequest { source, plan },
        )
        .await?;

        Ok(TranscodeOutput {
            output: BlobHandle::from_string(response.output),
            duration_seconds: response.duration_seconds,
        })
    }
}

// =============================================================================
// Billing sink
// =============================================================================

#[derive(Serialize)]
struct BillingDelivery<'a> {
    notice: &'a BillingNotice,
    signed: &'a str,
}

#[derive(Deserialize)]
struct BillingAck {
    #[serde(default)]
    #[allow(dead_code)]
    accepted: bool,
}

/// Billing sink delivering signed completion notices to a webhook.
pub struct WebhookBillingSink {
    client: Client,
    config: HttpProviderConfig,
}

impl WebhookBillingSink {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl BillingSink for WebhookBillingSink {
    async fn deliver(&self, notice: &BillingNotice, signed: &str) -> Result<(), CallError> {
        let _: BillingAck = post_json(
            &self.client,
            &self.config,
            "/v1/billing/completed",
            &BillingDelivery { notice, signed },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = HttpProviderConfig::new("https://api.example.com/").with_api_key("k");
        assert_eq!(config.base_url, "https://api.example.com/");
        assert_eq!(config.api_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_synthesize_response_defaults() {
        let json = r#"{"audio": "AAAA", "duration_seconds": 2.5}"#;
        let response: SynthesizeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.content_type, "audio/mpeg");
    }
}
