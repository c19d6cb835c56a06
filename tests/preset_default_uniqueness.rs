use std::sync::Arc;

use duostore::auth::{AuthUser, SharedAuth};
use duostore::core::DataCore;
use duostore::models::Preset;
use duostore::store::remote::InMemoryDocumentStore;

fn default_count(presets: &[Preset]) -> usize {
    presets.iter().filter(|p| p.is_default).count()
}

#[test]
fn at_most_one_default_after_any_sequence_of_calls_offline() {
    let auth = Arc::new(SharedAuth::new());
    let remote = Arc::new(InMemoryDocumentStore::new());
    let core = DataCore::open_in_memory(auth, remote).expect("core");

    let a = core.presets.create("A", "prompt a").expect("a");
    let b = core.presets.create("B", "prompt b").expect("b");
    let c = core.presets.create("C", "prompt c").expect("c");

    for id in [&a.id, &b.id, &c.id, &a.id, &c.id] {
        core.presets.set_as_default(id).expect("set default");
        let presets = core.presets.list().expect("list");
        assert_eq!(default_count(&presets), 1);
    }

    let presets = core.presets.list().expect("list");
    let default = presets.iter().find(|p| p.is_default).expect("default");
    assert_eq!(default.id, c.id);
}

#[test]
fn at_most_one_default_after_any_sequence_of_calls_remote() {
    let auth = Arc::new(SharedAuth::with_user(AuthUser::signed_in(
        "u1",
        "u1@example.com",
        "User One",
    )));
    let remote = Arc::new(InMemoryDocumentStore::new());
    let core = DataCore::open_in_memory(auth, remote).expect("core");

    let a = core.presets.create("A", "prompt a").expect("a");
    let b = core.presets.create("B", "prompt b").expect("b");

    core.presets.set_as_default(&a.id).expect("default a");
    core.presets.set_as_default(&b.id).expect("default b");
    core.presets.set_as_default(&b.id).expect("default b again");

    let presets = core.presets.list().expect("list");
    assert_eq!(default_count(&presets), 1);
    assert!(presets.iter().find(|p| p.id == b.id).expect("b").is_default);
}

#[test]
fn preset_update_and_delete_round_trip() {
    let auth = Arc::new(SharedAuth::new());
    let remote = Arc::new(InMemoryDocumentStore::new());
    let core = DataCore::open_in_memory(auth, remote).expect("core");

    let preset = core.presets.create("Draft", "old prompt").expect("create");
    core.presets
        .update(&preset.id, "Final", "new prompt")
        .expect("update");

    let presets = core.presets.list().expect("list");
    assert_eq!(presets.len(), 1);
    assert_eq!(presets[0].title, "Final");
    assert_eq!(presets[0].prompt, "new prompt");

    core.presets.delete(&preset.id).expect("delete");
    assert!(core.presets.list().expect("list").is_empty());
}
