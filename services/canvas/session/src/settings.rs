//! Immutable server settings snapshots.
//!
//! Sessions receive the snapshot that was current when they were authorized.
//! Reloading configuration swaps in a new snapshot; sessions already running
//! keep the one they started with.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Settings handed to the business logic at authorization time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSettings {
    /// User name to password
    pub credentials: HashMap<String, String>,
}

impl ServerSettings {
    /// Snapshot with the given credential table
    pub fn with_credentials(credentials: HashMap<String, String>) -> Self {
        Self { credentials }
    }

    /// Whether `user` exists and `password` matches
    pub fn check_credentials(&self, user: &str, password: &str) -> bool {
        self.credentials
            .get(user)
            .is_some_and(|expected| expected == password)
    }
}

/// Shared pointer to the current settings snapshot
#[derive(Debug, Default)]
pub struct SettingsHandle {
    current: RwLock<Arc<ServerSettings>>,
}

impl SettingsHandle {
    /// Start from `settings`
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    /// Snapshot in effect right now
    pub fn current(&self) -> Arc<ServerSettings> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the snapshot, returning the previous one
    pub fn swap(&self, settings: ServerSettings) -> Arc<ServerSettings> {
        let next = Arc::new(settings);
        info!("Swapping server settings ({} credentials)", next.credentials.len());
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, next)
    }
}
