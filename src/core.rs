use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::auth::AuthSession;
use crate::crypto::{FieldCipher, KdfParams};
use crate::migration::MigrationCoordinator;
use crate::model_state::ModelStateService;
use crate::notify::{Broadcaster, Listener, Notification};
use crate::repository::{
    AiMessageRepository, PresetRepository, ProviderSettingsRepository, SessionRepository,
    StoreContext, SummaryRepository, TranscriptRepository, UserRepository,
};
use crate::store::remote::DocumentStore;

/// Composition root of the persistence core: owns the repositories, the
/// model-state service and the notification port, and orchestrates what
/// happens on an auth-state change.
pub struct DataCore {
    ctx: Arc<StoreContext>,
    notifier: Arc<Broadcaster>,
    pub users: UserRepository,
    pub sessions: SessionRepository,
    pub presets: PresetRepository,
    pub provider_settings: ProviderSettingsRepository,
    pub messages: AiMessageRepository,
    pub summaries: SummaryRepository,
    pub transcripts: TranscriptRepository,
    pub model_state: ModelStateService,
}

impl DataCore {
    pub fn open(
        app_dir: &Path,
        auth: Arc<dyn AuthSession>,
        remote: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        let cipher = Arc::new(FieldCipher::new(KdfParams::default_params()));
        let ctx = StoreContext::open(app_dir, auth, cipher, remote)?;
        Self::from_context(ctx)
    }

    /// In-memory local backend; test wiring.
    pub fn open_in_memory(
        auth: Arc<dyn AuthSession>,
        remote: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        let cipher = Arc::new(FieldCipher::new(KdfParams::for_test()));
        let ctx = StoreContext::open_in_memory(auth, cipher, remote)?;
        Self::from_context(ctx)
    }

    fn from_context(ctx: Arc<StoreContext>) -> Result<Self> {
        let notifier = Arc::new(Broadcaster::new());

        let core = Self {
            users: UserRepository::new(Arc::clone(&ctx)),
            sessions: SessionRepository::new(Arc::clone(&ctx)),
            presets: PresetRepository::new(Arc::clone(&ctx)),
            provider_settings: ProviderSettingsRepository::new(Arc::clone(&ctx)),
            messages: AiMessageRepository::new(Arc::clone(&ctx)),
            summaries: SummaryRepository::new(Arc::clone(&ctx)),
            transcripts: TranscriptRepository::new(Arc::clone(&ctx)),
            model_state: ModelStateService::new(Arc::clone(&ctx), Arc::clone(&notifier)),
            ctx,
            notifier,
        };

        core.ctx
            .cipher()
            .initialize_key(&core.ctx.auth().current_user_id())?;
        if let Err(e) = core.model_state.reload() {
            log::warn!("initial model state load failed: {e:#}");
        }
        Ok(core)
    }

    pub fn context(&self) -> Arc<StoreContext> {
        Arc::clone(&self.ctx)
    }

    pub fn subscribe(&self, listener: Listener) {
        self.notifier.subscribe(listener);
    }

    /// Reacts to a sign-in/sign-out reported by the auth collaborator:
    /// re-keys the cipher, ensures the user record exists, kicks off the
    /// one-shot migration in the background, reloads model state from the
    /// now-active backend and notifies observers.
    pub fn handle_auth_state_changed(&self) -> Result<()> {
        let user = self.ctx.auth().current_user();
        self.ctx.cipher().initialize_key(&user.user_id)?;

        if user.is_logged_in {
            self.users.find_or_create(&user)?;
            MigrationCoordinator::spawn(Arc::clone(&self.ctx), user.user_id.clone());
        }

        if let Err(e) = self.model_state.reload() {
            log::warn!("model state reload failed after auth change: {e:#}");
        }

        self.notifier.emit(&Notification::UserStateChanged(user));
        Ok(())
    }

    /// Explicit account deletion: removes the user and everything it owns
    /// from the active backend, leaving no orphaned records.
    pub fn delete_account(&self) -> Result<()> {
        let uid = self.ctx.owner_id();

        self.sessions.delete_by_owner()?;
        self.presets.delete_by_owner()?;
        self.provider_settings.delete_by_owner()?;
        self.users.delete(&uid)?;

        if let Err(e) = self.model_state.reload() {
            log::warn!("model state reload failed after account deletion: {e:#}");
        }
        Ok(())
    }
}
