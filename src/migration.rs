use std::sync::Arc;
use std::thread;

use anyhow::Result;

use crate::repository::{
    AiMessageRepository, PresetRepository, ProviderSettingsRepository, SessionRepository,
    StoreContext, SummaryRepository, TranscriptRepository, UserRepository,
};

/// Migration failure. Contained here: logged, never surfaced to the login
/// flow, retried on the next qualifying sign-in.
#[derive(Debug)]
pub struct MigrationError {
    pub user_id: String,
    pub detail: String,
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "migration failed for {}: {}", self.user_id, self.detail)
    }
}

impl std::error::Error for MigrationError {}

/// One-shot transfer of a user's local records into the remote store on the
/// first authenticated session.
///
/// Safe to crash and re-run at any point: every remote write is an
/// id-preserving (or natural-key) upsert, and the `has_migrated` flag on the
/// local user row is only set after all writes land. Runs on a detached
/// thread via [`spawn`], never blocking the caller's login flow.
pub struct MigrationCoordinator {
    ctx: Arc<StoreContext>,
}

impl MigrationCoordinator {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }

    /// Fire-and-forget background run; failures are logged and retried on
    /// the next sign-in.
    pub fn spawn(ctx: Arc<StoreContext>, user_id: String) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let coordinator = MigrationCoordinator::new(ctx);
            match coordinator.run(&user_id) {
                Ok(true) => log::info!("migration completed for {user_id}"),
                Ok(false) => {}
                Err(e) => log::warn!(
                    "{}",
                    MigrationError {
                        user_id,
                        detail: format!("{e:#}"),
                    }
                ),
            }
        })
    }

    /// Returns `true` when a migration actually ran.
    pub fn run(&self, user_id: &str) -> Result<bool> {
        let users = UserRepository::new(Arc::clone(&self.ctx));

        // Gate: nothing local for this user, or already migrated.
        let Some(local_user) = users.find_local(user_id)? else {
            return Ok(false);
        };
        if local_user.has_migrated {
            return Ok(false);
        }

        log::info!("starting local-to-remote migration for {user_id}");

        let presets = PresetRepository::new(Arc::clone(&self.ctx));
        let settings = ProviderSettingsRepository::new(Arc::clone(&self.ctx));
        let sessions = SessionRepository::new(Arc::clone(&self.ctx));
        let messages = AiMessageRepository::new(Arc::clone(&self.ctx));
        let summaries = SummaryRepository::new(Arc::clone(&self.ctx));
        let transcripts = TranscriptRepository::new(Arc::clone(&self.ctx));

        // Provider settings first so credentials survive even a partial run;
        // the (user, provider) natural key makes re-runs converge.
        for row in settings.list_local_for(user_id)? {
            settings.upsert_remote(&row)?;
        }

        for preset in presets.list_local_for(user_id)? {
            presets.upsert_remote(&preset)?;
        }

        for session in sessions.list_local_for(user_id)? {
            sessions.upsert_remote(&session)?;
            for message in messages.list_local_by_session(&session.id)? {
                messages.upsert_remote(&message)?;
            }
            for summary in summaries.list_local_by_session(&session.id)? {
                summaries.upsert_remote(&summary)?;
            }
            for transcript in transcripts.list_local_by_session(&session.id)? {
                transcripts.upsert_remote(&transcript)?;
            }
        }

        // Only after every record landed remotely: flip the gate, then drop
        // the now-redundant local payload. The user row itself stays as the
        // carrier of the flag.
        users.set_migration_complete(user_id)?;
        sessions.delete_local_for(user_id)?;
        presets.delete_local_for(user_id)?;
        settings.delete_local_for(user_id)?;

        Ok(true)
    }
}
