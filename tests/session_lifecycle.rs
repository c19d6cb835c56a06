use std::sync::Arc;
use std::thread;
use std::time::Duration;

use duostore::auth::SharedAuth;
use duostore::core::DataCore;
use duostore::repository::{SummaryDraft, TranscriptSegment};
use duostore::store::remote::InMemoryDocumentStore;

fn offline_core() -> DataCore {
    let auth = Arc::new(SharedAuth::new());
    let remote = Arc::new(InMemoryDocumentStore::new());
    DataCore::open_in_memory(auth, remote).expect("core")
}

#[test]
fn ending_a_session_is_monotonic_and_idempotent() {
    let core = offline_core();
    let session = core.sessions.create("ask", "Short call").expect("session");
    assert!(session.ended_at_ms.is_none());

    let ended = core
        .sessions
        .end(&session.id)
        .expect("end")
        .expect("session exists");
    let ended_at = ended.ended_at_ms.expect("ended_at set");
    assert!(ended_at >= session.started_at_ms);

    // Ending again changes nothing.
    thread::sleep(Duration::from_millis(5));
    let again = core
        .sessions
        .end(&session.id)
        .expect("end")
        .expect("session exists");
    assert_eq!(again.ended_at_ms, Some(ended_at));

    let reread = core
        .sessions
        .find_by_id(&session.id)
        .expect("find")
        .expect("session");
    assert_eq!(reread.ended_at_ms, Some(ended_at));
}

#[test]
fn messages_keep_issue_order_and_token_totals() {
    let core = offline_core();
    let session = core.sessions.create("ask", "Tokens").expect("session");

    core.messages
        .add(&session.id, "user", "first", Some(10), None)
        .expect("m1");
    thread::sleep(Duration::from_millis(2));
    core.messages
        .add(&session.id, "assistant", "second", Some(25), Some("gpt-4.1"))
        .expect("m2");
    thread::sleep(Duration::from_millis(2));
    core.messages
        .add(&session.id, "user", "third", None, None)
        .expect("m3");

    let messages = core.messages.list_by_session(&session.id).expect("list");
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["first", "second", "third"]);

    assert_eq!(
        core.messages
            .sum_tokens_by_session(&session.id)
            .expect("sum"),
        35
    );
    assert_eq!(
        core.messages
            .count_by_session(&session.id)
            .expect("count"),
        3
    );
}

#[test]
fn transcripts_are_batch_inserted_in_start_order() {
    let core = offline_core();
    let session = core.sessions.create("listen", "Meeting").expect("session");

    let segments = vec![
        TranscriptSegment {
            speaker: "Them".to_string(),
            text: "second utterance".to_string(),
            lang: "en".to_string(),
            start_at_ms: 2_000,
            end_at_ms: Some(2_900),
        },
        TranscriptSegment {
            speaker: "Me".to_string(),
            text: "first utterance".to_string(),
            lang: "en".to_string(),
            start_at_ms: 1_000,
            end_at_ms: Some(1_800),
        },
    ];
    core.transcripts
        .add_batch(&session.id, &segments)
        .expect("batch");

    let transcripts = core
        .transcripts
        .list_by_session(&session.id)
        .expect("list");
    let texts: Vec<&str> = transcripts.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(texts, ["first utterance", "second utterance"]);
    assert_eq!(transcripts[0].speaker, "Me");
}

#[test]
fn latest_summary_wins_by_generation_time() {
    let core = offline_core();
    let session = core.sessions.create("listen", "Recap").expect("session");

    let first = SummaryDraft {
        tldr: "early take".to_string(),
        ..Default::default()
    };
    core.summaries.add(&session.id, &first).expect("s1");

    thread::sleep(Duration::from_millis(2));
    let second = SummaryDraft {
        tldr: "final take".to_string(),
        text: "longer recap".to_string(),
        model: Some("gpt-4.1".to_string()),
        tokens_used: Some(120),
        ..Default::default()
    };
    core.summaries.add(&session.id, &second).expect("s2");

    let latest = core
        .summaries
        .latest_by_session(&session.id)
        .expect("latest")
        .expect("summary");
    assert_eq!(latest.tldr, "final take");
    assert_eq!(latest.tokens_used, Some(120));

    assert_eq!(
        core.summaries
            .list_by_session(&session.id)
            .expect("list")
            .len(),
        2
    );
}

#[test]
fn deleting_a_session_removes_its_children() {
    let core = offline_core();
    let keep = core.sessions.create("ask", "Keep").expect("keep");
    let drop = core.sessions.create("ask", "Drop").expect("drop");

    core.messages
        .add(&keep.id, "user", "kept message", None, None)
        .expect("m-keep");
    core.messages
        .add(&drop.id, "user", "dropped message", None, None)
        .expect("m-drop");
    core.transcripts
        .add_batch(
            &drop.id,
            &[TranscriptSegment {
                speaker: "Me".to_string(),
                text: "gone".to_string(),
                lang: "en".to_string(),
                start_at_ms: 1,
                end_at_ms: None,
            }],
        )
        .expect("t-drop");

    core.sessions.delete(&drop.id).expect("delete");

    assert_eq!(core.sessions.list().expect("list").len(), 1);
    assert!(core
        .messages
        .list_by_session(&drop.id)
        .expect("messages")
        .is_empty());
    assert!(core
        .transcripts
        .list_by_session(&drop.id)
        .expect("transcripts")
        .is_empty());
    assert_eq!(
        core.messages
            .list_by_session(&keep.id)
            .expect("messages")
            .len(),
        1
    );
}

#[test]
fn title_updates_are_visible_on_reread() {
    let core = offline_core();
    let session = core.sessions.create("ask", "Untitled").expect("session");

    core.sessions
        .update_title(&session.id, "Named at last")
        .expect("update");

    let reread = core
        .sessions
        .find_by_id(&session.id)
        .expect("find")
        .expect("session");
    assert_eq!(reread.title, "Named at last");
}
