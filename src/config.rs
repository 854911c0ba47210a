use crate::settings::MAX_REFILL_CHECK;
use crate::storage::FileStorage;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const DEFAULT_IMAGE_MODEL: &str = "imagen-4.0-generate-001";
pub const DEFAULT_TTS_VOICE: &str = "Kore";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminCredentials {
    pub email: String,
    pub password: String,
}

/// Endpoint and model selection for the hosted AI API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub chat_model: String,
    pub tts_model: String,
    pub image_model: String,
    pub tts_voice: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            tts_model: DEFAULT_TTS_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            tts_voice: DEFAULT_TTS_VOICE.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub data_dir: PathBuf,
    pub refill_check_interval: Duration,
    pub enforce_credits: bool,
    pub admin: Option<AdminCredentials>,
}

impl AppConfig {
    /// Reads `NEPEX_*` variables; call after `.env` has been loaded.
    pub fn from_env() -> Self {
        let gateway = GatewayConfig {
            api_key: var("NEPEX_API_KEY").or_else(|| var("API_KEY")),
            api_base: var("NEPEX_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            chat_model: var("NEPEX_CHAT_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            tts_model: var("NEPEX_TTS_MODEL").unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string()),
            image_model: var("NEPEX_IMAGE_MODEL")
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            tts_voice: var("NEPEX_TTS_VOICE").unwrap_or_else(|| DEFAULT_TTS_VOICE.to_string()),
        };

        let data_dir = var("NEPEX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(FileStorage::default_root);

        let refill_secs = var("NEPEX_REFILL_CHECK_SECS")
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(MAX_REFILL_CHECK.as_secs())
            .clamp(1, MAX_REFILL_CHECK.as_secs());

        let admin = match (var("NEPEX_ADMIN_EMAIL"), var("NEPEX_ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(AdminCredentials { email, password }),
            _ => None,
        };

        Self {
            gateway,
            data_dir,
            refill_check_interval: Duration::from_secs(refill_secs),
            enforce_credits: is_truthy(var("NEPEX_ENFORCE_CREDITS").as_deref()),
            admin,
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.unwrap_or("false").to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
