use crate::clock::now_millis;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_TITLE: &str = "New Chat";
pub const TITLE_MAX_CHARS: usize = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

/// Binary payload carried as a `data:<mime>;base64,<payload>` URI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub data: String,
    pub mime_type: String,
    pub name: String,
}

impl Attachment {
    pub fn from_base64(
        payload: &str,
        mime_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let mime_type = mime_type.into();
        Self {
            data: format!("data:{mime_type};base64,{payload}"),
            mime_type,
            name: name.into(),
        }
    }

    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::from_base64(&STANDARD.encode(bytes), mime_type, name)
    }

    /// The base64 payload with the data URI header stripped.
    pub fn base64_payload(&self) -> &str {
        match self.data.split_once(',') {
            Some((_, payload)) => payload,
            None => &self.data,
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.base64_payload())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sender: Sender,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Set only while an image or audio result is pending.
    #[serde(default, skip_serializing_if = "is_false")]
    pub generating: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Message {
    pub fn user(text: impl Into<String>, attachment: Option<Attachment>) -> Self {
        Self {
            id: new_id("msg"),
            text: text.into(),
            sender: Sender::User,
            timestamp: now_millis(),
            attachment,
            generating: false,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            id: new_id("msg"),
            text: text.into(),
            sender: Sender::Assistant,
            timestamp: now_millis(),
            attachment: None,
            generating: false,
        }
    }

    /// True when there is neither visible text nor an attachment to send.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty() && self.attachment.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: i64,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: new_id("conv"),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now_millis(),
        }
    }

    pub fn message_index(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// Title derived from the first user message: trimmed, at most 30 characters.
pub fn title_from(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(TITLE_MAX_CHARS).collect())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub is_blocked: bool,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogKind {
    Login,
    Logout,
    Message,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    #[default]
    Default,
    Concise,
    Tutor,
    Developer,
    Creative,
}

impl Persona {
    pub const ALL: [Persona; 5] = [
        Persona::Default,
        Persona::Concise,
        Persona::Tutor,
        Persona::Developer,
        Persona::Creative,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(name.trim()))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Persona::Default => "default",
            Persona::Concise => "concise",
            Persona::Tutor => "tutor",
            Persona::Developer => "developer",
            Persona::Creative => "creative",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    #[default]
    Dark,
    System,
}

impl Theme {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            "system" => Some(Theme::System),
            _ => None,
        }
    }

    /// Whether the dark palette applies, given the host's color-scheme preference.
    pub fn is_dark(self, system_prefers_dark: bool) -> bool {
        match self {
            Theme::Light => false,
            Theme::Dark => true,
            Theme::System => system_prefers_dark,
        }
    }
}

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}
