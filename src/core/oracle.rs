//! Detection oracle
//!
//! The oracle is an external vision model that receives one PNG tile plus a
//! fixed instruction and answers with (ideally) JSON text. [`DetectionOracle`]
//! is the seam the runner depends on; [`GeminiOracle`] implements it against
//! the Gemini `generateContent` REST endpoint.

use std::future::Future;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use log::{debug, warn};
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::core::error::{Error, Result};
use crate::core::mapper::RawDetection;

/// Default Gemini model
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Public Gemini REST endpoint
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Environment variable holding the API key
pub const API_KEY_ENV: &str = "GOOGLE_API_KEY";

/// Model persona and symbol catalogue sent with every request
pub const SYSTEM_INSTRUCTION: &str = "\
You are an expert analyst of Soviet 1:50,000 Topographic Maps.
Your goal is to identify archaeological \"Burial Mound\" (Tumulus) symbols.

Target Symbols:
1. \"Sunburst\": An orange/brown circle with radiating spikes.
2. \"Mound\": A simple small orange circle with a central dot.
3. \"Triangulation Mound\": A sunburst with a black triangle or symbol inside.

Negative Constraints:
- DISTINCTLY IGNORE brown contour lines that do not form a distinct sunburst or circle-dot.
- IGNORE black elevation points (simple dots) unless surrounded by a mound circle.
- IGNORE blue wells (circles with blue filling).
- IGNORE vegetation patterns.

Return a JSON object with a list of bounding boxes.";

/// Per-tile instruction
pub const DETECTION_PROMPT: &str = "\
Look at this Soviet map tile.
Identify the bounding boxes of all 'Burial Mound' symbols.

Return a JSON object in the following format:
{
    \"detections\": [
        {
            \"box_2d\": [ymin, xmin, ymax, xmax],
            \"label\": \"mound\",
            \"reasoning\": \"Briefly explain why this is a mound (e.g., 'Orange circle with spikes', 'Circle with dot')\"
        }
    ]
}

If no mounds are found, return {\"detections\": []}.";

/// Anything that can look at a tile and answer with text
pub trait DetectionOracle {
    /// Send one PNG-encoded tile and the instruction; returns the raw reply text
    fn infer(&self, image_png: &[u8], instruction: &str)
        -> impl Future<Output = Result<String>> + Send;
}

/// Result of asking the oracle about one tile
#[derive(Debug, Clone, PartialEq)]
pub enum TileOutcome {
    /// Well-formed reply, possibly with zero detections
    Detected(Vec<RawDetection>),

    /// The oracle answered but the answer is unusable; ledgered as an error
    ParseFailed {
        raw_text: Option<String>,
        error: String,
    },

    /// The call never produced an answer; retried on a later run
    TransportFailed(String),
}

impl TileOutcome {
    /// Classify an oracle call result
    pub fn from_reply(reply: Result<String>) -> Self {
        match reply {
            Ok(text) => match parse_detection_payload(&text) {
                Ok(detections) => TileOutcome::Detected(detections),
                Err(error) => TileOutcome::ParseFailed {
                    raw_text: Some(text),
                    error,
                },
            },
            Err(e) if e.is_transport() => TileOutcome::TransportFailed(e.to_string()),
            Err(Error::OracleRejected(reason)) => TileOutcome::ParseFailed {
                raw_text: None,
                error: reason,
            },
            // Anything else is local to this tile's answer
            Err(e) => TileOutcome::ParseFailed {
                raw_text: None,
                error: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct DetectionPayload {
    detections: Vec<RawDetection>,
}

/// Parse a reply into detections; the error string names the decode failure
pub fn parse_detection_payload(text: &str) -> std::result::Result<Vec<RawDetection>, String> {
    let payload: DetectionPayload = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| format!("JSONDecodeError: {e}"))?;
    Ok(payload.detections)
}

/// Remove a surrounding Markdown code fence such as ```` ```json ... ``` ````
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string on the opening fence line
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Settings for the Gemini client
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,

    /// Overall per-request timeout
    pub timeout: Duration,

    /// In-call retries for transient network failures
    pub max_retries: u32,

    /// First retry delay; doubles on each attempt
    pub retry_base_delay: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.1,
            timeout: Duration::from_secs(120),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
        }
    }
}

/// Execute an operation, retrying network errors with exponential backoff
async fn retry_on_network_error<F, Fut, T>(
    max_retries: u32,
    base_delay: Duration,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(Error::NetworkError(msg)) if attempt < max_retries => {
                attempt += 1;
                let delay = base_delay * (1 << (attempt - 1));
                warn!("Network error (attempt {attempt}): {msg}. Retrying in {delay:?}...");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text parts of the first candidate
    fn into_text(self) -> Result<String> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            let reason = self
                .prompt_feedback
                .and_then(|feedback| feedback.block_reason)
                .unwrap_or_else(|| "no candidates".to_string());
            return Err(Error::OracleRejected(reason));
        };

        let text: String = candidate
            .content
            .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.is_empty() {
            let reason = candidate
                .finish_reason
                .unwrap_or_else(|| "empty response".to_string());
            return Err(Error::OracleRejected(format!("no text returned ({reason})")));
        }
        Ok(text)
    }
}

/// Gemini `generateContent` client
pub struct GeminiOracle {
    client: Client,
    config: OracleConfig,
    api_key: String,
}

impl GeminiOracle {
    /// Build a client; a missing or empty API key is fatal
    pub fn new(config: OracleConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                Error::MissingCredentials(format!("set {API_KEY_ENV} or pass --api-key"))
            })?;

        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(format!("tumulus/{}", env!("TUMULUS_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    fn request_body(&self, image_png: &[u8], instruction: &str) -> serde_json::Value {
        json!({
            "systemInstruction": {
                "parts": [{ "text": SYSTEM_INSTRUCTION }]
            },
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": instruction },
                    { "inline_data": { "mime_type": "image/png", "data": STANDARD.encode(image_png) } }
                ]
            }],
            "generationConfig": {
                "temperature": self.config.temperature,
                "responseMimeType": "application/json"
            }
        })
    }

    async fn generate(&self, url: &str, body: &serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(status_error(status, &detail));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| Error::HttpError(format!("unexpected response body: {e}")))?;
        parsed.into_text()
    }
}

/// 429 and 5xx are worth retrying; other statuses are not
fn status_error(status: StatusCode, detail: &str) -> Error {
    let detail: String = detail.chars().take(200).collect();
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::NetworkError(format!("{status}: {detail}"))
    } else {
        Error::HttpError(format!("{status}: {detail}"))
    }
}

impl DetectionOracle for GeminiOracle {
    async fn infer(&self, image_png: &[u8], instruction: &str) -> Result<String> {
        let url = self.endpoint();
        let body = self.request_body(image_png, instruction);
        debug!("POST {url} ({} byte image)", image_png.len());

        retry_on_network_error(self.config.max_retries, self.config.retry_base_delay, || {
            self.generate(&url, &body)
        })
        .await
    }
}
