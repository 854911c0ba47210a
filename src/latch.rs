use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// At most one in-flight generation per conversation.
#[derive(Clone, Default)]
pub struct GenerationLatch {
    held: Arc<Mutex<HashSet<String>>>,
}

impl GenerationLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, conversation_id: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.contains(conversation_id)
    }

    /// `None` when a generation already holds the latch for this conversation.
    pub fn try_acquire(&self, conversation_id: &str) -> Option<LatchGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(conversation_id.to_string()) {
            return None;
        }
        debug!(conversation = conversation_id, "generation latch acquired");
        Some(LatchGuard {
            held: self.held.clone(),
            conversation_id: conversation_id.to_string(),
        })
    }
}

/// Releases the latch when dropped, whether the generation settled or was abandoned.
pub struct LatchGuard {
    held: Arc<Mutex<HashSet<String>>>,
    conversation_id: String,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.conversation_id);
        debug!(conversation = %self.conversation_id, "generation latch released");
    }
}
