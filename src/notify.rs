use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::auth::AuthUser;

/// Snapshot of the model/provider state attached to update notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelStateSnapshot {
    pub api_keys: BTreeMap<String, Option<String>>,
    pub selected_llm: Option<String>,
    pub selected_stt: Option<String>,
}

/// Outbound events the core broadcasts. Fire-and-forget: every currently
/// registered listener is invoked, nothing more is guaranteed.
#[derive(Clone, Debug)]
pub enum Notification {
    ModelStateUpdated(ModelStateSnapshot),
    SettingsUpdated,
    /// Both model types lost their selection; the surface should prompt for
    /// a credential.
    ForceShowApiKeyHeader,
    UserStateChanged(AuthUser),
}

pub type Listener = Box<dyn Fn(&Notification) + Send + Sync>;

/// Publish/subscribe port. The embedding application owns fan-out to its UI
/// surfaces; the core only emits.
pub struct Broadcaster {
    listeners: Mutex<Vec<Listener>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, listener: Listener) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    pub fn emit(&self, notification: &Notification) {
        let Ok(listeners) = self.listeners.lock() else {
            return;
        };
        for listener in listeners.iter() {
            listener(notification);
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
