use super::{AiGateway, ChatRequest, ChatTurn, TextStream};
use crate::config::GatewayConfig;
use crate::error::{ChatError, ChatResult};
use crate::storage::{API_KEY_SLOT, KeyValueStore};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const API_KEY_HEADER: &str = "x-goog-api-key";

pub struct GeminiGateway {
    client: Client,
    config: GatewayConfig,
    credential_slot: Option<Arc<dyn KeyValueStore>>,
}

impl GeminiGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            credential_slot: None,
        }
    }

    /// Falls back to the cached credential slot when no key is configured.
    pub fn with_credential_slot(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.credential_slot = Some(storage);
        self
    }

    fn api_key(&self) -> ChatResult<String> {
        if let Some(key) = &self.config.api_key {
            return Ok(key.clone());
        }
        self.credential_slot
            .as_ref()
            .and_then(|storage| storage.get(API_KEY_SLOT))
            .filter(|key| !key.trim().is_empty())
            .ok_or(ChatError::MissingCredential)
    }

    fn endpoint(&self, model: &str, action: &str) -> String {
        format!(
            "{}/models/{model}:{action}",
            self.config.api_base.trim_end_matches('/')
        )
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> ChatResult<reqwest::Response> {
        let key = self.api_key()?;
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, key)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::generation(format!("Gemini error {status}: {body}")));
        }
        Ok(response)
    }
}

// ============================================
// Request types
// ============================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text {
        text: &'a str,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlinePart<'a>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlinePart<'a> {
    mime_type: &'a str,
    data: &'a str,
}

impl<'a> Content<'a> {
    fn from_turn(turn: &'a ChatTurn) -> Self {
        let mut parts = Vec::with_capacity(2);
        if let Some(text) = &turn.text {
            parts.push(Part::Text { text });
        }
        if let Some(inline) = &turn.inline_data {
            parts.push(Part::Inline {
                inline_data: InlinePart {
                    mime_type: &inline.mime_type,
                    data: &inline.data,
                },
            });
        }
        Self {
            role: Some(turn.role.as_str()),
            parts,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'a str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    instances: [PredictInstance<'a>; 1],
    parameters: PredictParameters,
}

#[derive(Serialize)]
struct PredictInstance<'a> {
    prompt: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters {
    sample_count: u32,
    output_mime_type: &'static str,
}

// ============================================
// Response types
// ============================================

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    inline_data: Option<ResponseInline>,
}

#[derive(Deserialize)]
struct ResponseInline {
    data: String,
}

impl GenerateContentResponse {
    fn first_parts(self) -> Vec<ResponsePart> {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts)
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
}

/// Text carried by one SSE `data:` payload of a streamed generateContent call.
pub fn parse_gemini_sse_data(data: &str) -> Option<String> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = serde_json::from_str::<GenerateContentResponse>(trimmed).ok()?;
    Some(
        parsed
            .first_parts()
            .into_iter()
            .filter_map(|part| part.text)
            .collect(),
    )
}

/// Splits a byte stream into SSE event payloads. Consecutive `data:` lines are
/// joined with newlines; a blank line ends the event.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Option<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if let Some(data) = self.data.take() {
                    events.push(data);
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("data:") {
                let fragment = rest.strip_prefix(' ').unwrap_or(rest);
                match &mut self.data {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(fragment);
                    }
                    None => self.data = Some(fragment.to_string()),
                }
            }
        }
        events
    }

    /// Flushes an event left open by a stream that ended without a blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let mut tail = std::mem::take(&mut self.buffer);
            tail.push(b'\n');
            let mut events = self.feed(&tail);
            if let Some(data) = self.data.take() {
                events.push(data);
            }
            return events.pop();
        }
        self.data.take()
    }
}

/// Text fragments carried by a streamed generateContent response body.
fn sse_text<S, B>(body: S) -> impl Stream<Item = ChatResult<String>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    try_stream! {
        let mut body = Box::pin(body);
        let mut decoder = SseDecoder::default();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for data in decoder.feed(chunk.as_ref()) {
                if let Some(piece) = parse_gemini_sse_data(&data)
                    && !piece.is_empty()
                {
                    yield piece;
                }
            }
        }
        if let Some(data) = decoder.finish()
            && let Some(piece) = parse_gemini_sse_data(&data)
            && !piece.is_empty()
        {
            yield piece;
        }
    }
}

#[async_trait]
impl AiGateway for GeminiGateway {
    async fn stream_chat(&self, request: ChatRequest) -> ChatResult<TextStream> {
        let contents = request
            .history
            .iter()
            .chain(std::iter::once(&request.input))
            .map(Content::from_turn)
            .collect();
        let body = GenerateContentRequest {
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::Text {
                    text: &request.system_instruction,
                }],
            }),
            contents,
            generation_config: None,
        };
        let url = format!(
            "{}?alt=sse",
            self.endpoint(&self.config.chat_model, "streamGenerateContent")
        );
        debug!(turns = request.history.len() + 1, "starting chat stream");
        let response = self.post(&url, &body).await?;

        Ok(Box::pin(sse_text(response.bytes_stream())))
    }

    async fn text_to_speech(&self, text: &str) -> ChatResult<String> {
        let utterance = format!("Say: {text}");
        let body = GenerateContentRequest {
            system_instruction: None,
            contents: vec![Content {
                role: None,
                parts: vec![Part::Text { text: &utterance }],
            }],
            generation_config: Some(GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: &self.config.tts_voice,
                        },
                    },
                },
            }),
        };
        let url = self.endpoint(&self.config.tts_model, "generateContent");
        let response = self.post(&url, &body).await?;
        let parsed: GenerateContentResponse = response.json().await?;
        parsed
            .first_parts()
            .into_iter()
            .find_map(|part| part.inline_data)
            .map(|inline| inline.data)
            .filter(|data| !data.is_empty())
            .ok_or(ChatError::EmptyResponse)
    }

    async fn generate_image(&self, prompt: &str) -> ChatResult<String> {
        let body = PredictRequest {
            instances: [PredictInstance { prompt }],
            parameters: PredictParameters {
                sample_count: 1,
                output_mime_type: "image/png",
            },
        };
        let url = self.endpoint(&self.config.image_model, "predict");
        let response = self.post(&url, &body).await?;
        let parsed: PredictResponse = response.json().await?;
        parsed
            .predictions
            .into_iter()
            .next()
            .and_then(|p| p.bytes_base64_encoded)
            .filter(|data| !data.is_empty())
            .ok_or(ChatError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gemini_data() {
        assert!(parse_gemini_sse_data("").is_none());
        assert!(parse_gemini_sse_data("not json").is_none());
        assert_eq!(
            parse_gemini_sse_data(
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#
            ),
            Some("Hello".to_string())
        );
        assert_eq!(
            parse_gemini_sse_data(r#"{"usageMetadata":{"totalTokenCount":3}}"#),
            Some(String::new())
        );
    }

    #[test]
    fn decoder_handles_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"data: {\"a\"").is_empty());
        assert!(decoder.feed(b":1}\r\n").is_empty());
        assert_eq!(decoder.feed(b"\r\ndata: second\n\n"), vec![
            "{\"a\":1}".to_string(),
            "second".to_string()
        ]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"data: tail").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn utf8_split_across_chunks_survives() {
        let text = "data: caf\u{e9}\n\n".as_bytes();
        let split = text.len() - 3;
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(&text[..split]).is_empty());
        assert_eq!(decoder.feed(&text[split..]), vec!["caf\u{e9}".to_string()]);
    }

    #[test]
    fn missing_credential_is_reported() {
        let gateway = GeminiGateway::new(GatewayConfig::default());
        assert!(matches!(gateway.api_key(), Err(ChatError::MissingCredential)));
    }

    #[test]
    fn credential_slot_is_a_fallback() {
        let storage = crate::storage::MemoryStorage::new();
        storage.set(API_KEY_SLOT, "from-slot").unwrap();
        let gateway = GeminiGateway::new(GatewayConfig::default())
            .with_credential_slot(Arc::new(storage));
        assert_eq!(gateway.api_key().unwrap(), "from-slot");
    }
}
