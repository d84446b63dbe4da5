//! Audio analysis pipeline
//!
//! Each submission goes through three model calls: an annotated
//! transcription of the audio, a short communication tip about what was
//! said, and a conversational reply.

use async_trait::async_trait;
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const USER_AGENT: &str = concat!("parley-server/", env!("CARGO_PKG_VERSION"));

const TRANSCRIPTION_PROMPT: &str = r#"Transcribe this audio, annotating emotions and speech patterns in square brackets.

1. Emotions and tone: [happy] [sad] [excited] [calm] [angry] [nervous] [curious] [thoughtful]
   [confident] [shy] [confused] [surprised] [worried] [playful]; prefix [very] or [slightly] for intensity.
2. Stuttering, marked [stutter] and written exactly as heard: sound repetitions ("b-b-book"),
   word repetitions ("I- I mean"), blocks ("...(trying to say)... hello"),
   prolongations ("ssssorry") and broken words ("ta...ble").
3. Other patterns: [whispering] [shouting] [singing] [rushing] [mumbling] [laughing] [sighing],
   and [pausing] for "...".

Patterns may be combined ([happy, laughing]). Mark tone changes where they occur.

Examples:
"[nervous, stutter] H-h-hi there [gaining confidence] how are you?"
"[thoughtful, pausing] Well... [stutter] I-I think so""#;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    /// Model answered without any text
    #[error("Empty response from model")]
    EmptyResponse,
}

/// What one submission produced
#[derive(Debug, Clone, PartialEq)]
pub struct Transcribed {
    pub text: String,
    /// Communication tip; `None` when that call failed
    pub analysis: Option<String>,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Emotion and stutter annotated transcription of WAV audio
    async fn transcribe(&self, audio: &[u8]) -> Result<String, AnalyzerError>;

    /// One or two sentence tip starting with "Communication Tip:"
    async fn analyse(&self, transcription: &str) -> Result<String, AnalyzerError>;

    /// Conversational answer to what the speaker said
    async fn reply(&self, transcription: &str) -> Result<String, AnalyzerError>;
}

/// Transcribe, then attach the analysis if it can be had
///
/// A failed analysis does not fail the submission.
pub async fn transcribe_and_analyse(
    analyzer: &dyn Analyzer,
    audio: &[u8],
) -> Result<Transcribed, AnalyzerError> {
    let text = analyzer.transcribe(audio).await?;
    let analysis = match analyzer.analyse(&text).await {
        Ok(analysis) => Some(analysis),
        Err(e) => {
            tracing::warn!(error = %e, "Analysis failed, sending transcription alone");
            None
        }
    };
    Ok(Transcribed { text, analysis })
}

fn analysis_prompt(transcription: &str) -> String {
    format!(
        "As a friendly communication coach, give a quick, casual tip about this message: \"{}\"\n\
         Keep it very brief (1-2 sentences) and conversational, like advice to a friend.\n\
         Start with \"Communication Tip:\" and focus on one specific thing they did well or could improve.",
        transcription
    )
}

fn reply_prompt(transcription: &str) -> String {
    format!(
        "You are having a friendly chat. The person said: \"{}\"\n\
         Respond naturally and conversationally, as if you're just having a normal chat.",
        transcription
    )
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize, Deserialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GenerateResponse {
    /// Concatenated text of the first candidate, trimmed
    fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                Part::InlineData { .. } => None,
            })
            .collect();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

/// Gemini `generateContent` client
pub struct GeminiAnalyzer {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiAnalyzer {
    pub fn new(api_key: String, model: String) -> Result<Self, AnalyzerError> {
        Self::with_base_url(api_key, model, GEMINI_BASE_URL.to_string())
    }

    pub fn with_base_url(
        api_key: String,
        model: String,
        base_url: String,
    ) -> Result<Self, AnalyzerError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AnalyzerError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    async fn generate(&self, parts: Vec<Part>) -> Result<String, AnalyzerError> {
        let request = GenerateRequest {
            contents: vec![Content { parts }],
        };

        let response = self
            .http_client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| AnalyzerError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AnalyzerError::ApiError(status.as_u16(), error_text));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AnalyzerError::ParseError(e.to_string()))?;

        let text = body.text().ok_or(AnalyzerError::EmptyResponse)?;
        tracing::debug!(model = %self.model, chars = text.len(), "Model call succeeded");
        Ok(text)
    }
}

#[async_trait]
impl Analyzer for GeminiAnalyzer {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, AnalyzerError> {
        tracing::info!(bytes = audio.len(), model = %self.model, "Requesting transcription");
        self.generate(vec![
            Part::Text {
                text: TRANSCRIPTION_PROMPT.to_string(),
            },
            Part::InlineData {
                inline_data: InlineData {
                    mime_type: "audio/wav".to_string(),
                    data: BASE64_STANDARD.encode(audio),
                },
            },
        ])
        .await
    }

    async fn analyse(&self, transcription: &str) -> Result<String, AnalyzerError> {
        self.generate(vec![Part::Text {
            text: analysis_prompt(transcription),
        }])
        .await
    }

    async fn reply(&self, transcription: &str) -> Result<String, AnalyzerError> {
        self.generate(vec![Part::Text {
            text: reply_prompt(transcription),
        }])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape_uses_inline_data() {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text { text: "hi".into() },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: "audio/wav".into(),
                            data: "AAAA".into(),
                        },
                    },
                ],
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(json["contents"][0]["parts"][1]["inline_data"]["mime_type"], "audio/wav");
    }

    #[test]
    fn test_response_text_joins_parts() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":" [happy] "},{"text":"hello "}]}}]}"#;
        let response: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.text().as_deref(), Some("[happy] hello"));
    }

    #[test]
    fn test_blocked_response_has_no_text() {
        let response: GenerateResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#).unwrap();
        assert!(response.text().is_none());
        let empty: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.text().is_none());
    }

    #[test]
    fn test_prompts_embed_transcription() {
        assert!(analysis_prompt("hi there").contains("\"hi there\""));
        assert!(analysis_prompt("x").contains("Communication Tip:"));
        assert!(reply_prompt("hi there").contains("\"hi there\""));
    }

    #[test]
    fn test_endpoint() {
        let analyzer = GeminiAnalyzer::with_base_url(
            "k".into(),
            "gemini-1.5-flash".into(),
            "http://127.0.0.1:1/v1beta/".into(),
        )
        .unwrap();
        assert_eq!(
            analyzer.endpoint(),
            "http://127.0.0.1:1/v1beta/models/gemini-1.5-flash:generateContent"
        );
    }

    struct FailingAnalysis;

    #[async_trait]
    impl Analyzer for FailingAnalysis {
        async fn transcribe(&self, _audio: &[u8]) -> Result<String, AnalyzerError> {
            Ok("[calm] hello".into())
        }
        async fn analyse(&self, _t: &str) -> Result<String, AnalyzerError> {
            Err(AnalyzerError::EmptyResponse)
        }
        async fn reply(&self, _t: &str) -> Result<String, AnalyzerError> {
            Ok("hi".into())
        }
    }

    #[tokio::test]
    async fn test_failed_analysis_keeps_transcription() {
        let result = transcribe_and_analyse(&FailingAnalysis, b"RIFF").await.unwrap();
        assert_eq!(result.text, "[calm] hello");
        assert_eq!(result.analysis, None);
    }
}
