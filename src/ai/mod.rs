/// AI gateway for Nepex
///
/// The hosted generative API is an opaque collaborator with three call shapes:
/// streaming chat, text-to-speech and image generation. No latency or retry
/// guarantees are assumed; callers recover locally from every failure.
///
/// # Architecture
///
/// - `AiGateway` - the seam the chat session talks to (fakes plug in here for tests)
/// - `gemini` - HTTP implementation against the Gemini / Imagen REST endpoints
mod gemini;

pub use gemini::{GeminiGateway, SseDecoder, parse_gemini_sse_data};

use crate::error::{ChatError, ChatResult};
use crate::types::{Message, Sender};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Lazy, ordered, finite sequence of text fragments. Concatenated they form the reply.
pub type TextStream = Pin<Box<dyn Stream<Item = ChatResult<String>> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Model,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Model => "model",
        }
    }
}

/// Binary part of a turn: bare base64 plus its MIME type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

impl ChatTurn {
    /// `None` for messages with neither text nor attachment (e.g. a placeholder
    /// that never received a chunk).
    pub fn from_message(message: &Message) -> Option<Self> {
        let text = Some(message.text.clone()).filter(|t| !t.is_empty());
        let inline_data = message.attachment.as_ref().map(|a| InlineData {
            mime_type: a.mime_type.clone(),
            data: a.base64_payload().to_string(),
        });
        if text.is_none() && inline_data.is_none() {
            return None;
        }
        let role = match message.sender {
            Sender::User => TurnRole::User,
            Sender::Assistant => TurnRole::Model,
        };
        Some(Self {
            role,
            text,
            inline_data,
        })
    }

    pub fn history(messages: &[Message]) -> Vec<Self> {
        messages.iter().filter_map(Self::from_message).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatRequest {
    pub system_instruction: String,
    pub history: Vec<ChatTurn>,
    pub input: ChatTurn,
}

impl ChatRequest {
    pub fn new(
        system_instruction: impl Into<String>,
        history: &[Message],
        prompt: &Message,
    ) -> ChatResult<Self> {
        let mut input = ChatTurn::from_message(prompt).ok_or(ChatError::EmptyMessage)?;
        input.role = TurnRole::User;
        Ok(Self {
            system_instruction: system_instruction.into(),
            history: ChatTurn::history(history),
            input,
        })
    }
}

#[async_trait]
pub trait AiGateway: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> ChatResult<TextStream>;

    /// Base64 audio for the given text.
    async fn text_to_speech(&self, text: &str) -> ChatResult<String>;

    /// Base64 PNG for the given prompt.
    async fn generate_image(&self, prompt: &str) -> ChatResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Attachment;

    #[test]
    fn history_skips_empty_messages_and_strips_data_uri() {
        let mut with_image = Message::user("", None);
        with_image.attachment = Some(Attachment::from_base64("AAAA", "image/png", "a.png"));
        let messages = vec![
            Message::user("hello", None),
            Message::assistant(""),
            Message::assistant("hi there"),
            with_image,
        ];

        let turns = ChatTurn::history(&messages);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, TurnRole::User);
        assert_eq!(turns[1].role, TurnRole::Model);
        assert_eq!(turns[1].text.as_deref(), Some("hi there"));
        let inline = turns[2].inline_data.as_ref().unwrap();
        assert_eq!(inline.data, "AAAA");
        assert_eq!(inline.mime_type, "image/png");
        assert!(turns[2].text.is_none());
    }

    #[test]
    fn blank_prompt_cannot_become_a_request() {
        let prompt = Message::user("", None);
        assert!(matches!(
            ChatRequest::new("sys", &[], &prompt),
            Err(ChatError::EmptyMessage)
        ));
    }
}
