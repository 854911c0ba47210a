use crate::clock::now_millis;
use crate::storage::{KeyValueStore, USERS_SLOT, read_json, write_json};
use crate::types::{User, new_id};
use std::sync::Arc;
use tracing::info;

/// Registry of users seen at login. The lower-cased email is the natural key.
pub struct UserRegistry {
    storage: Arc<dyn KeyValueStore>,
    users: Vec<User>,
}

pub fn normalize_email(email: &str) -> String {
    email.to_lowercase()
}

impl UserRegistry {
    pub fn load(storage: Arc<dyn KeyValueStore>) -> Self {
        let users = read_json(storage.as_ref(), USERS_SLOT).unwrap_or_default();
        Self { storage, users }
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn find_by_email(&self, email: &str) -> Option<&User> {
        let email = normalize_email(email);
        self.users.iter().find(|u| u.email == email)
    }

    /// Returns the existing record for a known email without touching storage.
    pub fn add_user(&mut self, email: &str) -> User {
        if let Some(existing) = self.find_by_email(email) {
            return existing.clone();
        }
        let user = User {
            id: new_id("user"),
            email: normalize_email(email),
            is_blocked: false,
            created_at: now_millis(),
        };
        info!(email = %user.email, "user registered");
        self.users.push(user.clone());
        self.persist();
        user
    }

    /// Flips the blocked flag; returns the new value, or `None` for an unknown id.
    pub fn toggle_blocked(&mut self, user_id: &str) -> Option<bool> {
        let user = self.users.iter_mut().find(|u| u.id == user_id)?;
        user.is_blocked = !user.is_blocked;
        let blocked = user.is_blocked;
        self.persist();
        Some(blocked)
    }

    fn persist(&self) {
        write_json(self.storage.as_ref(), USERS_SLOT, &self.users);
    }
}
