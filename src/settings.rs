//! User preferences and the daily credit grant.
//!
//! The refill rule is applied on load and by a background timer. Both recompute from
//! "now" instead of incrementing, so applying it twice in a row changes nothing the
//! second time.

use crate::clock::{DAY_MS, now_millis};
use crate::error::{ChatError, ChatResult};
use crate::prompts::INITIAL_CREDITS;
use crate::storage::{KeyValueStore, SETTINGS_SLOT, StorageSubscription, read_json, write_json};
use crate::types::{Persona, Theme};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound for the background refill check period.
pub const MAX_REFILL_CHECK: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub sound_effects: bool,
    pub persona: Persona,
    pub theme: Theme,
    pub credits: u32,
    pub next_refill_timestamp: i64,
}

impl Settings {
    pub fn defaults(now: i64) -> Self {
        Self {
            sound_effects: true,
            persona: Persona::Default,
            theme: Theme::Dark,
            credits: INITIAL_CREDITS,
            next_refill_timestamp: now + DAY_MS,
        }
    }

    pub fn merged(mut self, patch: &SettingsPatch) -> Self {
        if let Some(sound_effects) = patch.sound_effects {
            self.sound_effects = sound_effects;
        }
        if let Some(persona) = patch.persona {
            self.persona = persona;
        }
        if let Some(theme) = patch.theme {
            self.theme = theme;
        }
        if let Some(credits) = patch.credits {
            self.credits = credits;
        }
        if let Some(next_refill) = patch.next_refill_timestamp {
            self.next_refill_timestamp = next_refill;
        }
        self
    }
}

/// Partial settings. Also the shape persisted blobs are read through, so fields
/// missing from older blobs (or unknown legacy fields) are tolerated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_effects: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<Persona>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_refill_timestamp: Option<i64>,
}

pub struct SettingsStore {
    storage: Arc<dyn KeyValueStore>,
    settings: Settings,
}

pub type SharedSettings = Arc<Mutex<SettingsStore>>;

impl SettingsStore {
    /// Missing or corrupt data falls back to defaults. A blob without a credit balance
    /// or refill time, or whose refill time has passed, gets a fresh grant.
    pub fn load(storage: Arc<dyn KeyValueStore>, now: i64) -> Self {
        let settings = match read_json::<SettingsPatch>(storage.as_ref(), SETTINGS_SLOT) {
            Some(stored) => {
                let mut settings = Settings::defaults(now).merged(&stored);
                if stored.credits.is_none()
                    || stored.next_refill_timestamp.is_none()
                    || now >= settings.next_refill_timestamp
                {
                    settings.credits = INITIAL_CREDITS;
                    settings.next_refill_timestamp = now + DAY_MS;
                }
                settings
            }
            None => Settings::defaults(now),
        };
        let store = Self { storage, settings };
        store.persist();
        store
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn update(&mut self, patch: &SettingsPatch) {
        self.settings = self.settings.clone().merged(patch);
        debug!(?patch, "settings updated");
        self.persist();
    }

    pub fn refill_if_due(&mut self, now: i64) -> bool {
        if now < self.settings.next_refill_timestamp {
            return false;
        }
        self.settings.credits = INITIAL_CREDITS;
        self.settings.next_refill_timestamp = now + DAY_MS;
        info!(credits = INITIAL_CREDITS, "daily credits refilled");
        self.persist();
        true
    }

    pub fn try_spend(&mut self, cost: u32) -> ChatResult<()> {
        let available = self.settings.credits;
        if available < cost {
            return Err(ChatError::InsufficientCredits {
                needed: cost,
                available,
            });
        }
        self.settings.credits = available - cost;
        self.persist();
        Ok(())
    }

    /// Adopts a settings value written by another tab, merged over defaults.
    /// Last writer wins; returns whether the in-memory state changed.
    pub fn apply_external(&mut self, raw: &str, now: i64) -> bool {
        let patch: SettingsPatch = match serde_json::from_str(raw) {
            Ok(patch) => patch,
            Err(err) => {
                warn!(error = %err, "ignoring unparseable settings from another tab");
                return false;
            }
        };
        let incoming = Settings::defaults(now).merged(&patch);
        if incoming == self.settings {
            return false;
        }
        debug!("settings replaced by another tab");
        self.settings = incoming;
        true
    }

    /// Re-reads the settings slot after another tab touched it. A removed slot is
    /// ignored.
    pub fn reload_external(&mut self, now: i64) -> bool {
        match self.storage.get(SETTINGS_SLOT) {
            Some(raw) => self.apply_external(&raw, now),
            None => false,
        }
    }

    pub fn time_until_refill(&self, now: i64) -> Duration {
        let remaining = (self.settings.next_refill_timestamp - now).max(0);
        Duration::from_millis(remaining as u64)
    }

    /// `"Xh Ym Zs"` until the next grant, or `"Ready to refresh!"` once due.
    pub fn refill_countdown(&self, now: i64) -> String {
        if now >= self.settings.next_refill_timestamp {
            return "Ready to refresh!".to_string();
        }
        let remaining = self.time_until_refill(now).as_secs();
        let hours = remaining / 3600;
        let minutes = (remaining % 3600) / 60;
        let seconds = remaining % 60;
        format!("{hours}h {minutes}m {seconds}s")
    }

    fn persist(&self) {
        write_json(self.storage.as_ref(), SETTINGS_SLOT, &self.settings);
    }
}

fn lock(settings: &SharedSettings) -> std::sync::MutexGuard<'_, SettingsStore> {
    settings.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Periodic refill check. The period is capped at [`MAX_REFILL_CHECK`].
pub fn spawn_refill_timer(settings: SharedSettings, period: Duration) -> JoinHandle<()> {
    let period = period.clamp(Duration::from_millis(1), MAX_REFILL_CHECK);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            lock(&settings).refill_if_due(now_millis());
        }
    })
}

/// Applies settings written by other tabs until the subscription closes.
pub fn spawn_settings_sync(
    settings: SharedSettings,
    mut subscription: StorageSubscription,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            if event.affects(SETTINGS_SLOT) {
                lock(&settings).reload_external(now_millis());
            }
        }
    })
}
