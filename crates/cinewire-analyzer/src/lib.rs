//! Direct emotion-analysis channel.
//!
//! Classifies a single captured frame into an [`EmotionReading`] against the
//! Gemini generateContent API, without round-tripping through the director
//! service. The channel requires a credential; an empty credential leaves it
//! permanently disconnected without error, and every malformed or failed
//! response degrades to the fallback reading so the telemetry cadence is
//! never broken.

use anyhow::{anyhow, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use cinewire_schema::{EmotionReading, FrameSample};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const SYSTEM_PROMPT: &str = "You are analyzing a viewer's facial expression while they watch a film.\n\
After each image, return ONLY a JSON object - no markdown, no explanation:\n\
{\n\
  \"primary_emotion\": one of \"engaged\",\"bored\",\"confused\",\"amused\",\"tense\",\"surprised\",\"neutral\",\n\
  \"intensity\": integer 1-10,\n\
  \"attention\": one of \"screen\",\"away\",\"uncertain\",\n\
  \"confidence\": float 0.0-1.0\n\
}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
pub struct EmotionAnalyzer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    state_tx: watch::Sender<ChannelState>,
}

impl EmotionAnalyzer {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url(api_key, model, GEMINI_API_BASE)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
            state_tx,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Open the channel. A missing credential disables the feature without
    /// raising an error.
    pub fn connect(&self) {
        if self.api_key.is_empty() {
            tracing::info!("no analyzer credential configured, direct emotion channel disabled");
            return;
        }
        let _ = self.state_tx.send(ChannelState::Connecting);
        let _ = self.state_tx.send(ChannelState::Connected);
        tracing::info!(model = %self.model, "direct emotion channel connected");
    }

    pub fn disconnect(&self) {
        let _ = self.state_tx.send(ChannelState::Disconnected);
    }

    /// Classify one frame. Any failure (transport, API status, unparsable
    /// response text) degrades to [`EmotionReading::fallback`].
    pub async fn classify(&self, sample: &FrameSample) -> EmotionReading {
        match self.request_reading(sample).await {
            Ok(reading) => reading,
            Err(err) => {
                tracing::warn!(error = %err, "emotion classification failed, using fallback reading");
                EmotionReading::fallback()
            }
        }
    }

    async fn request_reading(&self, sample: &FrameSample) -> Result<EmotionReading> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let payload = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart::InlineData {
                    inline_data: GeminiInlineData {
                        mime_type: "image/jpeg".to_string(),
                        data: sample.image_base64.clone(),
                    },
                }],
            }],
            system_instruction: Some(GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart::Text {
                    text: SYSTEM_PROMPT.to_string(),
                }],
            }),
        };

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("analyzer api error ({status}): {text}"));
        }

        let body: GeminiResponse = resp.json().await?;
        let text = body
            .candidates
            .first()
            .and_then(|c| c.content.parts.iter().find_map(|p| match p {
                GeminiPart::Text { text } => Some(text.as_str()),
                _ => None,
            }))
            .ok_or_else(|| anyhow!("analyzer response contained no text part"))?;

        parse_reading(text)
    }
}

/// Extract an [`EmotionReading`] from free-form model output, tolerating
/// optional markdown code fences around the JSON object.
pub fn parse_reading(text: &str) -> Result<EmotionReading> {
    let stripped = strip_code_fences(text);
    serde_json::from_str(stripped)
        .map_err(|e| anyhow!("unparsable emotion reading: {e}: {stripped:.80}"))
}

fn strip_code_fences(text: &str) -> &str {
    let mut out = text.trim();
    for prefix in ["```json", "```JSON", "```"] {
        if let Some(rest) = out.strip_prefix(prefix) {
            out = rest.trim_start();
            break;
        }
    }
    if let Some(rest) = out.strip_suffix("```") {
        out = rest.trim_end();
    }
    out
}

// ============================================================
// Gemini API Types
// ============================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinewire_schema::{Attention, Emotion};
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample() -> FrameSample {
        FrameSample {
            image_base64: "aGVsbG8=".into(),
        }
    }

    #[test]
    fn parse_reading_bare_json() {
        let reading = parse_reading(
            r#"{"primary_emotion":"amused","intensity":7,"attention":"screen","confidence":0.9}"#,
        )
        .unwrap();
        assert_eq!(reading.primary_emotion, Emotion::Amused);
        assert_eq!(reading.intensity, 7);
    }

    #[test]
    fn parse_reading_strips_json_fence() {
        let text = "```json\n{\"primary_emotion\":\"tense\",\"intensity\":4,\"attention\":\"away\",\"confidence\":0.6}\n```";
        let reading = parse_reading(text).unwrap();
        assert_eq!(reading.primary_emotion, Emotion::Tense);
        assert_eq!(reading.attention, Attention::Away);
    }

    #[test]
    fn parse_reading_strips_plain_fence() {
        let text = "```\n{\"primary_emotion\":\"bored\",\"intensity\":2,\"attention\":\"screen\",\"confidence\":0.3}\n```";
        assert_eq!(
            parse_reading(text).unwrap().primary_emotion,
            Emotion::Bored
        );
    }

    #[test]
    fn parse_reading_rejects_prose() {
        assert!(parse_reading("The viewer looks quite bored to me.").is_err());
    }

    #[test]
    fn empty_credential_stays_disconnected() {
        let analyzer = EmotionAnalyzer::new("", DEFAULT_MODEL);
        analyzer.connect();
        assert_eq!(analyzer.state(), ChannelState::Disconnected);
        assert!(!analyzer.is_connected());
    }

    #[test]
    fn connect_then_disconnect() {
        let analyzer = EmotionAnalyzer::new("key", DEFAULT_MODEL);
        analyzer.connect();
        assert!(analyzer.is_connected());
        analyzer.disconnect();
        assert_eq!(analyzer.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn classify_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/models/.*:generateContent$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {
                        "role": "model",
                        "parts": [{"text": "```json\n{\"primary_emotion\":\"surprised\",\"intensity\":8,\"attention\":\"screen\",\"confidence\":0.8}\n```"}]
                    }
                }]
            })))
            .mount(&server)
            .await;

        let analyzer = EmotionAnalyzer::with_base_url("key", DEFAULT_MODEL, server.uri());
        analyzer.connect();
        let reading = analyzer.classify(&sample()).await;
        assert_eq!(reading.primary_emotion, Emotion::Surprised);
        assert_eq!(reading.intensity, 8);
    }

    #[tokio::test]
    async fn classify_malformed_text_degrades_to_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/models/.*:generateContent$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {
                        "role": "model",
                        "parts": [{"text": "cannot comply"}]
                    }
                }]
            })))
            .mount(&server)
            .await;

        let analyzer = EmotionAnalyzer::with_base_url("key", DEFAULT_MODEL, server.uri());
        let reading = analyzer.classify(&sample()).await;
        assert_eq!(reading, EmotionReading::fallback());
    }

    #[tokio::test]
    async fn classify_api_error_degrades_to_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let analyzer = EmotionAnalyzer::with_base_url("key", DEFAULT_MODEL, server.uri());
        let reading = analyzer.classify(&sample()).await;
        assert_eq!(reading, EmotionReading::fallback());
    }
}
