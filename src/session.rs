//! Persisted session flags and the demo login gate.
//!
//! The admin check compares a configured email/password pair in process. It gates
//! the admin panel of a single-user demo and is not an authentication boundary.

use crate::activity::ActivityLog;
use crate::config::AdminCredentials;
use crate::storage::{
    ADMIN_SESSION_SLOT, API_KEY_SLOT, CONVERSATIONS_SLOT, KeyValueStore, MAINTENANCE_SLOT,
    ONBOARDING_SLOT, read_flag, remove_slot, write_flag,
};
use crate::types::{LogKind, User};
use crate::users::{UserRegistry, normalize_email};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("Please enter an email address.")]
    MissingEmail,

    #[error("Please enter a password.")]
    MissingPassword,

    #[error("Incorrect password for admin.")]
    IncorrectAdminPassword,

    #[error("Your account has been suspended by an administrator.")]
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Admin,
    User(User),
}

pub struct Session {
    storage: Arc<dyn KeyValueStore>,
    admin: Option<AdminCredentials>,
}

impl Session {
    pub fn new(storage: Arc<dyn KeyValueStore>, admin: Option<AdminCredentials>) -> Self {
        Self { storage, admin }
    }

    pub fn maintenance_mode(&self) -> bool {
        read_flag(self.storage.as_ref(), MAINTENANCE_SLOT)
    }

    pub fn set_maintenance_mode(&self, enabled: bool) {
        info!(enabled, "maintenance mode changed");
        write_flag(self.storage.as_ref(), MAINTENANCE_SLOT, enabled);
    }

    pub fn is_admin(&self) -> bool {
        read_flag(self.storage.as_ref(), ADMIN_SESSION_SLOT)
    }

    /// Maintenance mode locks out everyone but an admin session.
    pub fn is_locked_out(&self) -> bool {
        self.maintenance_mode() && !self.is_admin()
    }

    pub fn onboarding_complete(&self) -> bool {
        self.storage.get(ONBOARDING_SLOT).is_some()
    }

    pub fn api_key(&self) -> Option<String> {
        self.storage
            .get(API_KEY_SLOT)
            .filter(|key| !key.trim().is_empty())
    }

    pub fn set_api_key(&self, key: &str) {
        let key = key.trim();
        let result = if key.is_empty() {
            self.storage.remove(API_KEY_SLOT)
        } else {
            self.storage.set(API_KEY_SLOT, key)
        };
        if let Err(err) = result {
            warn!(error = %err, "failed to store API credential");
        }
    }

    pub fn login(
        &self,
        email: &str,
        password: &str,
        users: &mut UserRegistry,
        log: &mut ActivityLog,
    ) -> Result<LoginOutcome, LoginError> {
        if email.trim().is_empty() {
            return Err(LoginError::MissingEmail);
        }
        if password.is_empty() {
            return Err(LoginError::MissingPassword);
        }

        if let Some(admin) = &self.admin
            && normalize_email(email) == normalize_email(&admin.email)
        {
            if password != admin.password {
                return Err(LoginError::IncorrectAdminPassword);
            }
            write_flag(self.storage.as_ref(), ADMIN_SESSION_SLOT, true);
            log.record(LogKind::Login, "Admin logged in", Some(email));
            self.complete_onboarding();
            return Ok(LoginOutcome::Admin);
        }

        if users.find_by_email(email).is_some_and(|u| u.is_blocked) {
            log.record(LogKind::Login, "Blocked user attempted login", Some(email));
            return Err(LoginError::Suspended);
        }

        let user = users.add_user(email);
        log.record(LogKind::Login, "User logged in via Email", Some(email));
        self.complete_onboarding();
        Ok(LoginOutcome::User(user))
    }

    /// Clears the session flags and the conversation history.
    pub fn logout(&self, log: &mut ActivityLog) {
        log.record(LogKind::Logout, "User logged out", None);
        let storage = self.storage.as_ref();
        remove_slot(storage, ONBOARDING_SLOT);
        remove_slot(storage, ADMIN_SESSION_SLOT);
        remove_slot(storage, CONVERSATIONS_SLOT);
    }

    fn complete_onboarding(&self) {
        write_flag(self.storage.as_ref(), ONBOARDING_SLOT, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    struct Fixture {
        storage: MemoryStorage,
        session: Session,
        users: UserRegistry,
        log: ActivityLog,
    }

    fn fixture() -> Fixture {
        let storage = MemoryStorage::new();
        let shared: Arc<dyn KeyValueStore> = Arc::new(storage.clone());
        Fixture {
            session: Session::new(
                shared.clone(),
                Some(AdminCredentials {
                    email: "admin@nepex.ai".into(),
                    password: "letmein".into(),
                }),
            ),
            users: UserRegistry::load(shared.clone()),
            log: ActivityLog::load(shared),
            storage,
        }
    }

    #[test]
    fn regular_login_registers_the_user() {
        let mut f = fixture();
        let outcome = f
            .session
            .login("New@Example.com", "pw", &mut f.users, &mut f.log)
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::User(ref u) if u.email == "new@example.com"));
        assert!(f.session.onboarding_complete());
        assert!(!f.session.is_admin());
        assert_eq!(f.log.entries().next().unwrap().kind, LogKind::Login);
    }

    #[test]
    fn blank_fields_are_rejected() {
        let mut f = fixture();
        assert_eq!(
            f.session.login("  ", "pw", &mut f.users, &mut f.log),
            Err(LoginError::MissingEmail)
        );
        assert_eq!(
            f.session.login("a@b.c", "", &mut f.users, &mut f.log),
            Err(LoginError::MissingPassword)
        );
        assert!(f.log.is_empty());
    }

    #[test]
    fn blocked_users_are_turned_away() {
        let mut f = fixture();
        let user = f.users.add_user("bad@example.com");
        f.users.toggle_blocked(&user.id);
        assert_eq!(
            f.session.login("bad@example.com", "pw", &mut f.users, &mut f.log),
            Err(LoginError::Suspended)
        );
        assert!(!f.session.onboarding_complete());
        assert_eq!(
            f.log.entries().next().unwrap().details,
            "Blocked user attempted login"
        );
    }

    #[test]
    fn admin_session_bypasses_maintenance() {
        let mut f = fixture();
        f.session.set_maintenance_mode(true);
        assert!(f.session.is_locked_out());
        assert_eq!(
            f.session
                .login("ADMIN@nepex.ai", "wrong", &mut f.users, &mut f.log),
            Err(LoginError::IncorrectAdminPassword)
        );
        assert_eq!(
            f.session
                .login("admin@nepex.ai", "letmein", &mut f.users, &mut f.log),
            Ok(LoginOutcome::Admin)
        );
        assert!(!f.session.is_locked_out());
        assert!(f.users.is_empty());
    }

    #[test]
    fn logout_clears_session_slots() {
        let mut f = fixture();
        f.storage.set(CONVERSATIONS_SLOT, "[]").unwrap();
        f.session
            .login("admin@nepex.ai", "letmein", &mut f.users, &mut f.log)
            .unwrap();
        f.session.logout(&mut f.log);
        assert!(!f.session.is_admin());
        assert!(!f.session.onboarding_complete());
        assert!(f.storage.get(CONVERSATIONS_SLOT).is_none());
        assert_eq!(f.log.entries().next().unwrap().kind, LogKind::Logout);
    }

    #[test]
    fn api_key_round_trips_through_its_slot() {
        let f = fixture();
        assert_eq!(f.session.api_key(), None);
        f.session.set_api_key("  secret  ");
        assert_eq!(f.session.api_key().as_deref(), Some("secret"));
        f.session.set_api_key("");
        assert_eq!(f.session.api_key(), None);
    }
}
