//! Conversation list, active pointer and the message reducer.
//!
//! Every mutation rewrites the conversations slot in full. Edits and regenerations
//! share one algorithm: keep the history strictly before a pivot user message, keep
//! the pivot (possibly updated) as the last message, and hand both to the caller
//! together with the conversation's generation latch.

use crate::command::ChatCommand;
use crate::error::{ChatError, ChatResult};
use crate::latch::{GenerationLatch, LatchGuard};
use crate::storage::{CONVERSATIONS_SLOT, KeyValueStore, read_json, remove_slot, write_json};
use crate::types::{Attachment, Conversation, Message, Sender, title_from};
use std::sync::Arc;
use tracing::{debug, info};

/// A generation that holds its conversation's latch until dropped.
pub struct PendingGeneration {
    pub conversation_id: String,
    /// Messages strictly before the pivot.
    pub history: Vec<Message>,
    /// The user message the generation answers.
    pub prompt: Message,
    _latch: LatchGuard,
}

impl PendingGeneration {
    pub fn command(&self) -> ChatCommand {
        ChatCommand::parse(&self.prompt.text)
    }
}

pub struct ConversationStore {
    storage: Arc<dyn KeyValueStore>,
    conversations: Vec<Conversation>,
    active_id: Option<String>,
    latch: GenerationLatch,
}

impl ConversationStore {
    /// Restores the persisted list; a missing, corrupt or empty slot yields one fresh
    /// conversation. The first conversation becomes active.
    pub fn load(storage: Arc<dyn KeyValueStore>) -> Self {
        let conversations: Vec<Conversation> =
            read_json(storage.as_ref(), CONVERSATIONS_SLOT).unwrap_or_default();
        let active_id = conversations.first().map(|c| c.id.clone());
        let mut store = Self {
            storage,
            conversations,
            active_id,
            latch: GenerationLatch::new(),
        };
        if store.conversations.is_empty() {
            store.create_conversation();
        }
        info!(count = store.conversations.len(), "conversations loaded");
        store
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active_id.as_deref()
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.active_id.as_deref().and_then(|id| self.conversation(id))
    }

    pub fn is_generating(&self, conversation_id: &str) -> bool {
        self.latch.is_held(conversation_id)
    }

    pub fn total_message_count(&self) -> usize {
        self.conversations.iter().map(|c| c.messages.len()).sum()
    }

    pub fn create_conversation(&mut self) -> Conversation {
        let conversation = Conversation::new();
        debug!(conversation = %conversation.id, "conversation created");
        self.conversations.insert(0, conversation.clone());
        self.active_id = Some(conversation.id.clone());
        self.persist();
        conversation
    }

    /// Drops every conversation and starts over with one fresh one, overwriting the
    /// persisted list. Generations still in flight find their target gone and drop
    /// their output.
    pub fn reset(&mut self) {
        info!(count = self.conversations.len(), "conversation history cleared");
        self.conversations.clear();
        self.active_id = None;
        self.create_conversation();
    }

    /// Unknown ids leave the active pointer untouched.
    pub fn select_conversation(&mut self, id: &str) -> bool {
        if self.conversation(id).is_none() {
            return false;
        }
        self.active_id = Some(id.to_string());
        true
    }

    /// Never leaves the store empty: deleting the last conversation creates a new one.
    pub fn delete_conversation(&mut self, id: &str) -> bool {
        let before = self.conversations.len();
        self.conversations.retain(|c| c.id != id);
        if self.conversations.len() == before {
            return false;
        }
        debug!(conversation = id, "conversation deleted");

        if self.conversations.is_empty() {
            self.create_conversation();
            return true;
        }
        if self.active_id.as_deref() == Some(id) {
            self.active_id = self.conversations.first().map(|c| c.id.clone());
        }
        self.persist();
        true
    }

    pub fn append_user_message(
        &mut self,
        conversation_id: &str,
        text: &str,
        attachment: Option<Attachment>,
    ) -> ChatResult<Message> {
        let message = Message::user(text, attachment);
        if message.is_blank() {
            return Err(ChatError::EmptyMessage);
        }
        let conversation = self.conversation_mut(conversation_id)?;
        if conversation.messages.is_empty()
            && let Some(title) = title_from(text)
        {
            conversation.title = title;
        }
        conversation.messages.push(message.clone());
        self.persist();
        Ok(message)
    }

    /// Validates, takes the latch and appends the user message in one step.
    /// `Ok(None)` means a generation is already running and nothing changed.
    pub fn begin_send(
        &mut self,
        conversation_id: &str,
        text: &str,
        attachment: Option<Attachment>,
    ) -> ChatResult<Option<PendingGeneration>> {
        if text.trim().is_empty() && attachment.is_none() {
            return Err(ChatError::EmptyMessage);
        }
        self.conversation_mut(conversation_id)?;
        let Some(guard) = self.latch.try_acquire(conversation_id) else {
            return Ok(None);
        };

        let history = self.conversation_mut(conversation_id)?.messages.clone();
        let prompt = self.append_user_message(conversation_id, text, attachment)?;
        Ok(Some(PendingGeneration {
            conversation_id: conversation_id.to_string(),
            history,
            prompt,
            _latch: guard,
        }))
    }

    /// Empty assistant message used as the target of streamed chunks.
    pub fn append_assistant_placeholder(&mut self, conversation_id: &str) -> ChatResult<String> {
        self.push_assistant(conversation_id, Message::assistant(""))
    }

    /// Assistant message flagged as generating until an image or audio result lands.
    pub fn append_generating_placeholder(
        &mut self,
        conversation_id: &str,
        text: &str,
    ) -> ChatResult<String> {
        let mut message = Message::assistant(text);
        message.generating = true;
        self.push_assistant(conversation_id, message)
    }

    pub fn stream_append_to_message(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        chunk: &str,
    ) -> bool {
        let Some(message) = self.message_mut(conversation_id, message_id) else {
            return false;
        };
        message.text.push_str(chunk);
        self.persist();
        true
    }

    pub fn finalize_generated_attachment(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        attachment: Attachment,
    ) -> bool {
        let Some(message) = self.message_mut(conversation_id, message_id) else {
            return false;
        };
        message.generating = false;
        message.text.clear();
        message.attachment = Some(attachment);
        self.persist();
        true
    }

    pub fn finalize_generated_failure(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        error_text: &str,
    ) -> bool {
        let Some(message) = self.message_mut(conversation_id, message_id) else {
            return false;
        };
        message.generating = false;
        message.attachment = None;
        message.text = error_text.to_string();
        self.persist();
        true
    }

    /// Truncates to everything before the edited user message and re-appends it with
    /// the new text. `None` (and no change) while a generation runs, for unknown ids,
    /// assistant messages, or an edit that leaves the message blank.
    pub fn edit_message(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        new_text: &str,
    ) -> Option<PendingGeneration> {
        let conversation = self.conversation(conversation_id)?;
        let index = conversation.message_index(message_id)?;
        let mut prompt = conversation.messages[index].clone();
        if prompt.sender != Sender::User {
            return None;
        }
        prompt.text = new_text.to_string();
        if prompt.is_blank() {
            return None;
        }
        self.pivot(conversation_id, index, prompt)
    }

    /// Truncates to the most recent user message (inclusive) and re-runs from there.
    pub fn regenerate_last_response(&mut self, conversation_id: &str) -> Option<PendingGeneration> {
        let conversation = self.conversation(conversation_id)?;
        let index = conversation
            .messages
            .iter()
            .rposition(|m| m.sender == Sender::User)?;
        let prompt = conversation.messages[index].clone();
        self.pivot(conversation_id, index, prompt)
    }

    fn pivot(
        &mut self,
        conversation_id: &str,
        index: usize,
        prompt: Message,
    ) -> Option<PendingGeneration> {
        let guard = self.latch.try_acquire(conversation_id)?;
        let conversation = self.conversation_mut(conversation_id).ok()?;
        conversation.messages.truncate(index);
        let history = conversation.messages.clone();
        conversation.messages.push(prompt.clone());
        self.persist();
        Some(PendingGeneration {
            conversation_id: conversation_id.to_string(),
            history,
            prompt,
            _latch: guard,
        })
    }

    fn push_assistant(&mut self, conversation_id: &str, message: Message) -> ChatResult<String> {
        let id = message.id.clone();
        self.conversation_mut(conversation_id)?.messages.push(message);
        self.persist();
        Ok(id)
    }

    fn conversation_mut(&mut self, id: &str) -> ChatResult<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))
    }

    fn message_mut(&mut self, conversation_id: &str, message_id: &str) -> Option<&mut Message> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)?
            .message_mut(message_id)
    }

    fn persist(&self) {
        if self.conversations.is_empty() {
            remove_slot(self.storage.as_ref(), CONVERSATIONS_SLOT);
        } else {
            write_json(self.storage.as_ref(), CONVERSATIONS_SLOT, &self.conversations);
        }
    }
}
