use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use duostore::auth::{AuthSession, AuthUser, SharedAuth};
use duostore::core::DataCore;
use duostore::migration::MigrationCoordinator;
use duostore::store::remote::{
    DocumentStore, Filter, InMemoryDocumentStore, SortOrder, UpdateOutcome,
};

struct CountingDocumentStore {
    inner: InMemoryDocumentStore,
    writes: AtomicUsize,
}

impl CountingDocumentStore {
    fn new() -> Self {
        Self {
            inner: InMemoryDocumentStore::new(),
            writes: AtomicUsize::new(0),
        }
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl DocumentStore for CountingDocumentStore {
    fn insert_one(&self, collection: &str, doc: Value) -> Result<String> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.inner.insert_one(collection, doc)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
        self.inner.find_one(collection, filter)
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<(&str, SortOrder)>,
    ) -> Result<Vec<Value>> {
        self.inner.find(collection, filter, sort)
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Value,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.inner.update_one(collection, filter, patch, upsert)
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.inner.delete_many(collection, filter)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.inner.count(collection, filter)
    }

    fn sum(&self, collection: &str, filter: &Filter, field: &str) -> Result<i64> {
        self.inner.sum(collection, filter, field)
    }
}

fn known_offline_user() -> AuthUser {
    AuthUser {
        user_id: "u1".to_string(),
        is_logged_in: false,
        email: Some("u1@example.com".to_string()),
        display_name: Some("User One".to_string()),
    }
}

#[test]
fn first_signin_migrates_local_data_then_stays_quiet() {
    let auth = Arc::new(SharedAuth::with_user(known_offline_user()));
    let remote = Arc::new(CountingDocumentStore::new());
    let core = DataCore::open_in_memory(auth.clone(), remote.clone()).expect("core");

    // Local-only era: user record, a preset, a session with content, and a
    // provider credential, all owned by u1 in the embedded store.
    core.users
        .find_or_create(&auth.current_user())
        .expect("local user");
    let preset = core
        .presets
        .create("Interview", "You are an interview copilot.")
        .expect("preset");
    let session = core.sessions.create("ask", "Planning").expect("session");
    core.messages
        .add(&session.id, "user", "hello", Some(3), None)
        .expect("message");
    core.model_state
        .set_api_key("openai", "sk-test")
        .expect("api key");

    assert_eq!(remote.writes(), 0, "offline writes must not touch the remote");

    // Sign in; the coordinator is run synchronously here to keep the test
    // deterministic (production spawns it on a background thread).
    auth.set_current(AuthUser::signed_in("u1", "u1@example.com", "User One"));
    let migrated = MigrationCoordinator::new(core.context())
        .run("u1")
        .expect("migration");
    assert!(migrated);

    // The active backend is now the remote store; reads must come back
    // equivalent, ids preserved.
    let presets = core.presets.list().expect("remote presets");
    assert_eq!(presets.len(), 1);
    assert_eq!(presets[0].id, preset.id);
    assert_eq!(presets[0].title, "Interview");
    assert_eq!(presets[0].prompt, "You are an interview copilot.");

    let sessions = core.sessions.list().expect("remote sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, session.id);
    assert_eq!(sessions[0].title, "Planning");

    let messages = core.messages.list_by_session(&session.id).expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello");

    core.model_state.reload().expect("reload");
    assert_eq!(core.model_state.get_api_key("openai").as_deref(), Some("sk-test"));
    assert_eq!(
        core.model_state.get_selected_models().llm.as_deref(),
        Some("gpt-4.1")
    );

    // Second run: the has_migrated gate short-circuits before any write.
    let writes_after_first = remote.writes();
    let rerun = MigrationCoordinator::new(core.context())
        .run("u1")
        .expect("rerun");
    assert!(!rerun);
    assert_eq!(remote.writes(), writes_after_first);

    // The migrated local payload is gone: back in offline mode the store is
    // empty for u1 (only the flagged user row remains).
    auth.set_current(known_offline_user());
    assert!(core.presets.list().expect("local presets").is_empty());
    assert!(core.sessions.list().expect("local sessions").is_empty());
    assert!(core.provider_settings.all().expect("local settings").is_empty());
}

#[test]
fn migration_without_local_record_is_a_noop() {
    let auth = Arc::new(SharedAuth::new());
    let remote = Arc::new(CountingDocumentStore::new());
    let core = DataCore::open_in_memory(auth.clone(), remote.clone()).expect("core");

    auth.set_current(AuthUser::signed_in("fresh", "fresh@example.com", "Fresh"));
    let migrated = MigrationCoordinator::new(core.context())
        .run("fresh")
        .expect("migration");
    assert!(!migrated);
    assert_eq!(remote.writes(), 0);
}

#[test]
fn migration_is_idempotent_over_remote_content() {
    let auth = Arc::new(SharedAuth::with_user(known_offline_user()));
    let remote = Arc::new(CountingDocumentStore::new());
    let core = DataCore::open_in_memory(auth.clone(), remote.clone()).expect("core");

    core.users
        .find_or_create(&auth.current_user())
        .expect("local user");
    core.presets.create("A", "prompt a").expect("preset");
    core.model_state
        .set_api_key("gemini", "gm-key")
        .expect("api key");

    auth.set_current(AuthUser::signed_in("u1", "u1@example.com", "User One"));

    let coordinator = MigrationCoordinator::new(core.context());
    coordinator.run("u1").expect("first run");

    let presets_filter = Filter::new().eq("userId", "u1");
    let count_after_first = remote
        .count("presets", &presets_filter)
        .expect("preset count");
    let settings_after_first = remote
        .count("provider_settings", &presets_filter)
        .expect("settings count");

    coordinator.run("u1").expect("second run");

    assert_eq!(
        remote.count("presets", &presets_filter).expect("count"),
        count_after_first
    );
    assert_eq!(
        remote
            .count("provider_settings", &presets_filter)
            .expect("count"),
        settings_after_first
    );
    assert_eq!(count_after_first, 1);
    assert_eq!(settings_after_first, 1);
}
