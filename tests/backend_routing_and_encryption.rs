use std::sync::Arc;

use serde_json::json;

use duostore::auth::{AuthSession, AuthUser, SharedAuth};
use duostore::core::DataCore;
use duostore::store::remote::{DocumentStore, Filter, InMemoryDocumentStore};

fn signed_in_user() -> AuthUser {
    AuthUser::signed_in("cloud-user", "cloud@example.com", "Cloud User")
}

#[test]
fn writes_route_to_the_backend_matching_auth_state() {
    let auth = Arc::new(SharedAuth::new());
    let remote = Arc::new(InMemoryDocumentStore::new());
    let core = DataCore::open_in_memory(auth.clone(), remote.clone()).expect("core");

    // Signed out: everything stays in the embedded store.
    let offline_session = core.sessions.create("ask", "Offline notes").expect("session");
    assert!(remote.dump("sessions").is_empty());
    assert_eq!(core.sessions.list().expect("list").len(), 1);

    // Sign in: the same adapter now reads and writes the remote store.
    auth.set_current(signed_in_user());
    core.handle_auth_state_changed().expect("auth change");

    assert!(core.sessions.list().expect("list").is_empty());
    let online_session = core.sessions.create("listen", "Standup").expect("session");
    assert_eq!(remote.dump("sessions").len(), 1);

    let sessions = core.sessions.list().expect("list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, online_session.id);

    // Sign out again: the offline session is still there, untouched.
    auth.sign_out();
    core.handle_auth_state_changed().expect("auth change");
    let sessions = core.sessions.list().expect("list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, offline_session.id);
}

#[test]
fn sensitive_fields_are_encrypted_at_rest_and_clear_on_read() {
    let auth = Arc::new(SharedAuth::with_user(signed_in_user()));
    let remote = Arc::new(InMemoryDocumentStore::new());
    let core = DataCore::open_in_memory(auth, remote.clone()).expect("core");

    let session = core
        .sessions
        .create("ask", "Quarterly planning")
        .expect("session");
    core.messages
        .add(&session.id, "user", "the secret agenda", Some(5), None)
        .expect("message");

    let stored_sessions = remote.dump("sessions");
    let stored_title = stored_sessions[0]["title"].as_str().expect("title");
    assert!(stored_title.starts_with("dv1:"));
    assert_ne!(stored_title, "Quarterly planning");

    let stored_messages = remote.dump("ai_messages");
    let stored_content = stored_messages[0]["content"].as_str().expect("content");
    assert!(stored_content.starts_with("dv1:"));

    let sessions = core.sessions.list().expect("list");
    assert_eq!(sessions[0].title, "Quarterly planning");
    let messages = core.messages.list_by_session(&session.id).expect("list");
    assert_eq!(messages[0].content, "the secret agenda");
}

#[test]
fn an_undecryptable_field_never_aborts_a_read() {
    let auth = Arc::new(SharedAuth::with_user(signed_in_user()));
    let remote = Arc::new(InMemoryDocumentStore::new());
    let core = DataCore::open_in_memory(auth, remote.clone()).expect("core");

    // A document whose title looks encrypted but cannot be opened with any
    // key, plus one legacy plaintext document from before encryption.
    remote
        .insert_one(
            "sessions",
            json!({
                "id": "corrupt",
                "userId": "cloud-user",
                "title": "dv1:not-actually-ciphertext",
                "session_type": "ask",
                "started_at": 1000,
                "ended_at": null,
                "createdAt": 1000,
                "updatedAt": 1000,
            }),
        )
        .expect("insert corrupt");
    remote
        .insert_one(
            "sessions",
            json!({
                "id": "legacy",
                "userId": "cloud-user",
                "title": "plain old title",
                "session_type": "ask",
                "started_at": 2000,
                "ended_at": null,
                "createdAt": 2000,
                "updatedAt": 2000,
            }),
        )
        .expect("insert legacy");

    let sessions = core.sessions.list().expect("list must not fail");
    assert_eq!(sessions.len(), 2);

    let corrupt = sessions.iter().find(|s| s.id == "corrupt").expect("corrupt");
    assert_eq!(corrupt.title, "dv1:not-actually-ciphertext");
    let legacy = sessions.iter().find(|s| s.id == "legacy").expect("legacy");
    assert_eq!(legacy.title, "plain old title");
}

#[test]
fn deleting_the_account_leaves_no_orphans() {
    let auth = Arc::new(SharedAuth::with_user(signed_in_user()));
    let remote = Arc::new(InMemoryDocumentStore::new());
    let core = DataCore::open_in_memory(auth.clone(), remote.clone()).expect("core");

    core.users
        .find_or_create(&auth.current_user())
        .expect("user");
    let session = core.sessions.create("ask", "Doomed").expect("session");
    core.messages
        .add(&session.id, "user", "bye", None, None)
        .expect("message");
    core.summaries
        .add(&session.id, &Default::default())
        .expect("summary");
    core.presets.create("P", "prompt").expect("preset");
    core.model_state
        .set_api_key("openai", "sk-test")
        .expect("key");

    core.delete_account().expect("delete account");

    for collection in ["users", "sessions", "ai_messages", "summaries", "transcripts", "presets", "provider_settings"] {
        let remaining = remote
            .count(collection, &Filter::new())
            .expect("count");
        assert_eq!(remaining, 0, "collection {collection} must be empty");
    }
}
