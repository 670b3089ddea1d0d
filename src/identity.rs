//! Boundary to the identity collaborator. The engine never issues tokens.
use crate::types::UserId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

pub trait Identity: Send + Sync {
    fn current_user(&self, session_token: &str) -> Option<UserId>;
}

/// Token table filled in by whatever verified the credentials.
#[derive(Default)]
pub struct TokenTable {
    sessions: RwLock<HashMap<String, UserId>>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, user: UserId) {
        self.write().insert(token.into(), user);
    }

    pub fn revoke(&self, token: &str) {
        self.write().remove(token);
    }

    // A poisoned map is recovered so revocation always lands.
    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, UserId>> {
        self.sessions.write().unwrap_or_else(|poisoned| {
            warn!("session table lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, UserId>> {
        self.sessions.read().unwrap_or_else(|poisoned| {
            warn!("session table lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

impl Identity for TokenTable {
    fn current_user(&self, session_token: &str) -> Option<UserId> {
        self.read().get(session_token).cloned()
    }
}
