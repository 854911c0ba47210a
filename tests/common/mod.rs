//! Shared fixtures: a scripted gateway and a session over in-memory slots.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use nepex::ChatSession;
use nepex::activity::ActivityLog;
use nepex::ai::{AiGateway, ChatRequest, TextStream};
use nepex::conversations::ConversationStore;
use nepex::error::{ChatError, ChatResult};
use nepex::settings::SettingsStore;
use nepex::storage::MemoryStorage;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NOW: i64 = 1_700_000_000_000;

/// One scripted reply to a chat request.
pub enum Reply {
    Chunks(Vec<&'static str>),
    /// Yields the chunks, then fails mid-stream.
    Broken(Vec<&'static str>),
    Refuse,
    /// Waits before answering with the given text.
    Slow(Duration, &'static str),
}

#[derive(Default)]
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<Reply>>,
    images: Mutex<VecDeque<ChatResult<String>>>,
    speech: Mutex<Option<String>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub image_prompts: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn image(&self, result: ChatResult<String>) {
        self.images.lock().unwrap().push_back(result);
    }

    pub fn speech(&self, audio: &str) {
        *self.speech.lock().unwrap() = Some(audio.to_string());
    }

    pub fn last_request(&self) -> ChatRequest {
        self.requests.lock().unwrap().last().cloned().expect("no chat request")
    }
}

#[async_trait]
impl AiGateway for ScriptedGateway {
    async fn stream_chat(&self, request: ChatRequest) -> ChatResult<TextStream> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Chunks(vec!["ok"]));
        let items: Vec<ChatResult<String>> = match reply {
            Reply::Chunks(chunks) => chunks.into_iter().map(|c| Ok(c.to_string())).collect(),
            Reply::Broken(chunks) => chunks
                .into_iter()
                .map(|c| Ok(c.to_string()))
                .chain(std::iter::once(Err(ChatError::generation("stream reset"))))
                .collect(),
            Reply::Refuse => return Err(ChatError::MissingCredential),
            Reply::Slow(delay, text) => {
                tokio::time::sleep(delay).await;
                vec![Ok(text.to_string())]
            }
        };
        Ok(Box::pin(stream::iter(items)))
    }

    async fn text_to_speech(&self, _text: &str) -> ChatResult<String> {
        self.speech
            .lock()
            .unwrap()
            .clone()
            .ok_or(ChatError::EmptyResponse)
    }

    async fn generate_image(&self, prompt: &str) -> ChatResult<String> {
        self.image_prompts.lock().unwrap().push(prompt.to_string());
        self.images
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ChatError::EmptyResponse))
    }
}

pub struct Harness {
    pub storage: MemoryStorage,
    pub gateway: Arc<ScriptedGateway>,
    pub chat: ChatSession,
}

impl Harness {
    pub fn new() -> Self {
        let storage = MemoryStorage::new();
        let gateway = ScriptedGateway::new();
        let shared = Arc::new(storage.clone());
        let chat = ChatSession::new(
            Arc::new(Mutex::new(ConversationStore::load(shared.clone()))),
            Arc::new(Mutex::new(SettingsStore::load(shared.clone(), NOW))),
            Arc::new(Mutex::new(ActivityLog::load(shared))),
            gateway.clone(),
        );
        Self {
            storage,
            gateway,
            chat,
        }
    }

    pub fn active_id(&self) -> String {
        self.chat
            .conversations()
            .active_id()
            .expect("active conversation")
            .to_string()
    }

    pub fn texts(&self, conversation_id: &str) -> Vec<String> {
        self.chat
            .conversations()
            .conversation(conversation_id)
            .expect("conversation")
            .messages
            .iter()
            .map(|m| m.text.clone())
            .collect()
    }

    pub fn log_details(&self) -> Vec<String> {
        self.chat
            .activity()
            .entries()
            .map(|e| e.details.clone())
            .collect()
    }
}
