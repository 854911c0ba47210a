//! Chat session: the send / edit / regenerate control flow.
//!
//! Each entry point takes the conversation's generation latch together with its
//! optimistic store mutation, dispatches on the prompt (`/imagine` or streaming chat),
//! and writes the result back into the store message by message. The latch guard
//! travels with the [`PendingGeneration`] and is released when the generation settles
//! or its future is dropped.

use crate::activity::ActivityLog;
use crate::ai::{AiGateway, ChatRequest};
use crate::command::ChatCommand;
use crate::conversations::{ConversationStore, PendingGeneration};
use crate::error::{ChatError, ChatResult};
use crate::prompts::{
    CONNECTION_ERROR_TEXT, IMAGE_COST, IMAGE_ERROR_TEXT, MESSAGE_COST, system_prompt,
};
use crate::settings::{SettingsStore, SharedSettings};
use crate::types::{Attachment, LogKind, Sender};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

const IMAGE_NAME_CHARS: usize = 15;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// The assistant message holds the full reply or the generated image.
    Completed { message_id: String },
    /// The assistant message holds a fallback error text.
    Failed { message_id: String },
    /// Another generation holds the latch, or the target message was not eligible.
    /// Nothing was changed.
    Skipped,
}

#[derive(Clone)]
pub struct ChatSession {
    conversations: Arc<Mutex<ConversationStore>>,
    settings: SharedSettings,
    activity: Arc<Mutex<ActivityLog>>,
    gateway: Arc<dyn AiGateway>,
    enforce_credits: bool,
}

impl ChatSession {
    pub fn new(
        conversations: Arc<Mutex<ConversationStore>>,
        settings: SharedSettings,
        activity: Arc<Mutex<ActivityLog>>,
        gateway: Arc<dyn AiGateway>,
    ) -> Self {
        Self {
            conversations,
            settings,
            activity,
            gateway,
            enforce_credits: false,
        }
    }

    /// Deduct message and image costs from the credit balance before generating.
    pub fn with_credit_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_credits = enforce;
        self
    }

    pub fn conversations(&self) -> MutexGuard<'_, ConversationStore> {
        self.conversations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> MutexGuard<'_, SettingsStore> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn activity(&self) -> MutexGuard<'_, ActivityLog> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        attachment: Option<Attachment>,
    ) -> ChatResult<GenerationOutcome> {
        let pending = {
            let mut settings = self.settings();
            self.ensure_affordable(&settings, text)?;
            let pending = self
                .conversations()
                .begin_send(conversation_id, text, attachment)?;
            let Some(pending) = pending else {
                debug!(conversation = conversation_id, "send ignored while generating");
                return Ok(GenerationOutcome::Skipped);
            };
            self.charge(&mut settings, &pending);
            pending
        };
        self.record(LogKind::Message, "User sent a message");
        self.generate(pending).await
    }

    /// Replaces a user message's text, drops everything after it and generates a new
    /// reply.
    pub async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        new_text: &str,
    ) -> ChatResult<GenerationOutcome> {
        let pending = {
            let mut settings = self.settings();
            self.ensure_affordable(&settings, new_text)?;
            let pending = self
                .conversations()
                .edit_message(conversation_id, message_id, new_text);
            let Some(pending) = pending else {
                return Ok(GenerationOutcome::Skipped);
            };
            self.charge(&mut settings, &pending);
            pending
        };
        self.record(LogKind::Message, "User edited message");
        self.generate(pending).await
    }

    pub async fn regenerate(&self, conversation_id: &str) -> ChatResult<GenerationOutcome> {
        let pending = {
            let mut settings = self.settings();
            let last_prompt = self.conversations().conversation(conversation_id).and_then(|c| {
                c.messages
                    .iter()
                    .rev()
                    .find(|m| m.sender == Sender::User)
                    .map(|m| m.text.clone())
            });
            if let Some(prompt) = &last_prompt {
                self.ensure_affordable(&settings, prompt)?;
            }
            let pending = self.conversations().regenerate_last_response(conversation_id);
            let Some(pending) = pending else {
                return Ok(GenerationOutcome::Skipped);
            };
            self.charge(&mut settings, &pending);
            pending
        };
        self.record(LogKind::Message, "User regenerated response");
        self.generate(pending).await
    }

    /// Base64 audio for `text`, or `None` when synthesis fails.
    pub async fn speak(&self, text: &str) -> Option<String> {
        if text.trim().is_empty() {
            return None;
        }
        match self.gateway.text_to_speech(text).await {
            Ok(audio) => Some(audio),
            Err(err) => {
                warn!(error = %err, "speech synthesis failed");
                None
            }
        }
    }

    async fn generate(&self, pending: PendingGeneration) -> ChatResult<GenerationOutcome> {
        match pending.command() {
            ChatCommand::Imagine { prompt } => self.run_image(&pending, &prompt).await,
            ChatCommand::Plain => self.run_chat(&pending).await,
        }
    }

    async fn run_chat(&self, pending: &PendingGeneration) -> ChatResult<GenerationOutcome> {
        let conversation_id = pending.conversation_id.as_str();
        let message_id = self
            .conversations()
            .append_assistant_placeholder(conversation_id)?;

        match self.stream_reply(pending, &message_id).await {
            Ok(()) => {
                info!(conversation = conversation_id, "response generated");
                self.record(LogKind::Message, "AI generated response");
                Ok(GenerationOutcome::Completed { message_id })
            }
            Err(err) => {
                warn!(conversation = conversation_id, error = %err, "chat generation failed");
                self.conversations().finalize_generated_failure(
                    conversation_id,
                    &message_id,
                    CONNECTION_ERROR_TEXT,
                );
                self.record(LogKind::Error, &format!("Chat generation failed: {err}"));
                Ok(GenerationOutcome::Failed { message_id })
            }
        }
    }

    async fn stream_reply(&self, pending: &PendingGeneration, message_id: &str) -> ChatResult<()> {
        let persona = self.settings().get().persona;
        let request = ChatRequest::new(system_prompt(persona), &pending.history, &pending.prompt)?;
        let mut stream = self.gateway.stream_chat(request).await?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            let applied = self.conversations().stream_append_to_message(
                &pending.conversation_id,
                message_id,
                &chunk,
            );
            if !applied {
                // Conversation deleted mid-stream; stop pulling chunks.
                debug!(conversation = %pending.conversation_id, "stream target vanished");
                break;
            }
        }
        Ok(())
    }

    async fn run_image(
        &self,
        pending: &PendingGeneration,
        prompt: &str,
    ) -> ChatResult<GenerationOutcome> {
        let conversation_id = pending.conversation_id.as_str();
        let message_id = self
            .conversations()
            .append_generating_placeholder(conversation_id, &format!("Generating: {prompt}"))?;

        match self.gateway.generate_image(prompt).await {
            Ok(payload) => {
                let name: String = prompt.chars().take(IMAGE_NAME_CHARS).collect();
                let image = Attachment::from_base64(&payload, "image/png", format!("{name}.png"));
                self.conversations()
                    .finalize_generated_attachment(conversation_id, &message_id, image);
                info!(conversation = conversation_id, "image generated");
                self.record(LogKind::Message, "AI generated image");
                Ok(GenerationOutcome::Completed { message_id })
            }
            Err(err) => {
                warn!(conversation = conversation_id, error = %err, "image generation failed");
                self.conversations().finalize_generated_failure(
                    conversation_id,
                    &message_id,
                    IMAGE_ERROR_TEXT,
                );
                self.record(LogKind::Error, &format!("Image generation failed: {err}"));
                Ok(GenerationOutcome::Failed { message_id })
            }
        }
    }

    fn ensure_affordable(&self, settings: &SettingsStore, text: &str) -> ChatResult<()> {
        if !self.enforce_credits {
            return Ok(());
        }
        let needed = cost_of(&ChatCommand::parse(text));
        let available = settings.get().credits;
        if available < needed {
            return Err(ChatError::InsufficientCredits { needed, available });
        }
        Ok(())
    }

    fn charge(&self, settings: &mut SettingsStore, pending: &PendingGeneration) {
        if !self.enforce_credits {
            return;
        }
        if let Err(err) = settings.try_spend(cost_of(&pending.command())) {
            warn!(error = %err, "credit deduction failed");
        }
    }

    fn record(&self, kind: LogKind, details: &str) {
        self.activity().record(kind, details, None);
    }
}

fn cost_of(command: &ChatCommand) -> u32 {
    if command.is_image() {
        IMAGE_COST
    } else {
        MESSAGE_COST
    }
}
