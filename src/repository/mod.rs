use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use rusqlite::Connection;

use crate::auth::AuthSession;
use crate::crypto::FieldCipher;
use crate::store::local;
use crate::store::remote::DocumentStore;

mod ai_message;
mod preset;
mod provider_settings;
mod session;
mod summary;
mod transcript;
mod user;

pub use ai_message::AiMessageRepository;
pub use preset::PresetRepository;
pub use provider_settings::ProviderSettingsRepository;
pub use session::SessionRepository;
pub use summary::{SummaryDraft, SummaryRepository};
pub use transcript::{TranscriptRepository, TranscriptSegment};
pub use user::UserRepository;

/// The physical persistence system a repository call is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Local,
    Remote,
}

/// Backend I/O failure. Propagated to the repository caller, who owns the
/// retry policy; adapters never retry or swallow these.
#[derive(Debug)]
pub struct StorageError {
    pub entity: &'static str,
    pub op: &'static str,
    pub detail: String,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{} failed: {}", self.entity, self.op, self.detail)
    }
}

impl std::error::Error for StorageError {}

pub(crate) fn storage_error(
    entity: &'static str,
    op: &'static str,
) -> impl FnOnce(anyhow::Error) -> anyhow::Error {
    move |e| {
        StorageError {
            entity,
            op,
            detail: format!("{e:#}"),
        }
        .into()
    }
}

/// Shared wiring for every repository adapter: the auth collaborator (owner
/// injection and backend selection), the field cipher, and the two backends.
pub struct StoreContext {
    auth: Arc<dyn AuthSession>,
    cipher: Arc<FieldCipher>,
    local: Mutex<Connection>,
    remote: Arc<dyn DocumentStore>,
}

impl StoreContext {
    pub fn open(
        app_dir: &Path,
        auth: Arc<dyn AuthSession>,
        cipher: Arc<FieldCipher>,
        remote: Arc<dyn DocumentStore>,
    ) -> Result<Arc<Self>> {
        let conn = local::open(app_dir)?;
        Ok(Arc::new(Self {
            auth,
            cipher,
            local: Mutex::new(conn),
            remote,
        }))
    }

    /// In-memory local backend; test wiring.
    pub fn open_in_memory(
        auth: Arc<dyn AuthSession>,
        cipher: Arc<FieldCipher>,
        remote: Arc<dyn DocumentStore>,
    ) -> Result<Arc<Self>> {
        let conn = local::open_in_memory()?;
        Ok(Arc::new(Self {
            auth,
            cipher,
            local: Mutex::new(conn),
            remote,
        }))
    }

    /// Active backend for one repository call. Read exactly once per call so
    /// a concurrent sign-in/sign-out cannot split a call across backends.
    pub fn backend(&self) -> Backend {
        if self.auth.current_user().is_logged_in {
            Backend::Remote
        } else {
            Backend::Local
        }
    }

    /// Owner id injected into every adapter operation; callers never supply
    /// it, which keeps writes from crossing user boundaries.
    pub fn owner_id(&self) -> String {
        self.auth.current_user_id()
    }

    pub fn auth(&self) -> &dyn AuthSession {
        self.auth.as_ref()
    }

    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    pub(crate) fn remote(&self) -> &dyn DocumentStore {
        self.remote.as_ref()
    }

    pub(crate) fn with_local<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.local.lock().map_err(|_| anyhow!("poisoned lock"))?;
        f(&conn)
    }
}
