use thiserror::Error;

/// Errors raised by the conversation core and the AI gateway.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Cannot send an empty message")]
    EmptyMessage,

    #[error("No API credential configured")]
    MissingCredential,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Not enough credits: need {needed}, have {available}")]
    InsufficientCredits { needed: u32, available: u32 },

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("The AI endpoint returned no payload")]
    EmptyResponse,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ChatError {
    pub fn generation(message: impl Into<String>) -> Self {
        ChatError::Generation(message.into())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
