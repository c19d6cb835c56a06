use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use duostore::auth::SharedAuth;
use duostore::core::DataCore;
use duostore::model_state::ModelNotAvailable;
use duostore::notify::Notification;
use duostore::providers::ModelKind;
use duostore::store::remote::InMemoryDocumentStore;

fn offline_core() -> DataCore {
    let auth = Arc::new(SharedAuth::new());
    let remote = Arc::new(InMemoryDocumentStore::new());
    DataCore::open_in_memory(auth, remote).expect("core")
}

#[test]
fn no_credentials_yields_empty_models_and_rejects_selection() {
    let core = offline_core();

    assert!(core.model_state.get_available_models(ModelKind::Llm).is_empty());
    assert!(core.model_state.get_available_models(ModelKind::Stt).is_empty());

    let err = core
        .model_state
        .set_selected_model(ModelKind::Llm, "gpt-4.1")
        .expect_err("selection without credentials must fail");
    assert!(err.is::<ModelNotAvailable>());

    let selected = core.model_state.get_selected_models();
    assert_eq!(selected.llm, None);
    assert_eq!(selected.stt, None);
}

#[test]
fn setting_an_api_key_auto_selects_both_model_types() {
    let core = offline_core();

    core.model_state
        .set_api_key("openai", "sk-test")
        .expect("set key");

    let selected = core.model_state.get_selected_models();
    assert_eq!(selected.llm.as_deref(), Some("gpt-4.1"));
    assert_eq!(selected.stt.as_deref(), Some("gpt-4o-mini-transcribe"));

    let llm_models = core.model_state.get_available_models(ModelKind::Llm);
    assert!(llm_models.iter().any(|m| m.id == "gpt-4o-mini"));
}

#[test]
fn empty_api_key_is_rejected_without_side_effects() {
    let core = offline_core();

    assert!(core.model_state.set_api_key("openai", "   ").is_err());
    assert!(core.model_state.set_api_key("nonexistent", "sk-x").is_err());

    assert_eq!(core.model_state.get_api_key("openai"), None);
    assert!(core.model_state.get_available_models(ModelKind::Llm).is_empty());
}

#[test]
fn removing_the_only_key_clears_selection_and_fires_header_once() {
    let core = offline_core();
    let header_events = Arc::new(AtomicUsize::new(0));
    {
        let header_events = Arc::clone(&header_events);
        core.subscribe(Box::new(move |n| {
            if matches!(n, Notification::ForceShowApiKeyHeader) {
                header_events.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    core.model_state
        .set_api_key("openai", "sk-test")
        .expect("set key");
    assert_eq!(header_events.load(Ordering::Relaxed), 0);

    let removed = core.model_state.remove_api_key("openai").expect("remove");
    assert!(removed);

    let selected = core.model_state.get_selected_models();
    assert_eq!(selected.llm, None);
    assert_eq!(selected.stt, None);
    assert_eq!(core.model_state.get_api_key("openai"), None);
    assert_eq!(header_events.load(Ordering::Relaxed), 1);

    // Nothing left to remove; no further events.
    let removed_again = core.model_state.remove_api_key("openai").expect("remove");
    assert!(!removed_again);
    assert_eq!(header_events.load(Ordering::Relaxed), 1);
}

#[test]
fn removing_the_backing_provider_forces_reselection_to_another() {
    let core = offline_core();

    core.model_state
        .set_api_key("gemini", "gm-key")
        .expect("set gemini");
    core.model_state
        .set_api_key("openai", "sk-test")
        .expect("set openai");
    core.model_state
        .set_selected_model(ModelKind::Llm, "gpt-4o-mini")
        .expect("select");

    core.model_state.remove_api_key("openai").expect("remove");

    let selected = core.model_state.get_selected_models();
    assert_eq!(selected.llm.as_deref(), Some("gemini-2.5-flash"));
    assert_eq!(selected.stt.as_deref(), Some("gemini-live-2.5-flash"));

    let available = core.model_state.get_available_models(ModelKind::Llm);
    assert!(available.iter().all(|m| m.provider != "openai"));
}

#[test]
fn explicit_selection_survives_a_reload() {
    let core = offline_core();

    core.model_state
        .set_api_key("gemini", "gm-key")
        .expect("set key");
    core.model_state
        .set_selected_model(ModelKind::Llm, "gemini-2.5-pro")
        .expect("select");

    core.model_state.reload().expect("reload");

    let selected = core.model_state.get_selected_models();
    assert_eq!(selected.llm.as_deref(), Some("gemini-2.5-pro"));
}

#[test]
fn update_notifications_carry_the_new_state() {
    let core = offline_core();
    let updates = Arc::new(AtomicUsize::new(0));
    {
        let updates = Arc::clone(&updates);
        core.subscribe(Box::new(move |n| {
            if let Notification::ModelStateUpdated(snapshot) = n {
                if snapshot.selected_llm.is_some() {
                    updates.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    core.model_state
        .set_api_key("anthropic", "sk-ant-test")
        .expect("set key");
    assert!(updates.load(Ordering::Relaxed) >= 1);
}
