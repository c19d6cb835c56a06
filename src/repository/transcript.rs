use std::sync::Arc;

use anyhow::Result;
use rusqlite::params;
use serde_json::json;

use crate::models::{new_id, Transcript};
use crate::store::remote::{Filter, SortOrder};

use super::{storage_error, Backend, StoreContext};

const ENTITY: &str = "transcript";
const COLLECTION: &str = "transcripts";

const TAG_SPEAKER: &str = "transcript.speaker";
const TAG_TEXT: &str = "transcript.text";

/// One captured speech segment, before persistence.
#[derive(Clone, Debug)]
pub struct TranscriptSegment {
    pub speaker: String,
    pub text: String,
    pub lang: String,
    pub start_at_ms: i64,
    pub end_at_ms: Option<i64>,
}

pub struct TranscriptRepository {
    ctx: Arc<StoreContext>,
}

impl TranscriptRepository {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }

    fn decrypt(&self, mut transcript: Transcript) -> Transcript {
        let cipher = self.ctx.cipher();
        transcript.speaker = cipher.decrypt_field_or_raw(&transcript.speaker, TAG_SPEAKER);
        transcript.text = cipher.decrypt_field_or_raw(&transcript.text, TAG_TEXT);
        transcript
    }

    fn row_to_transcript(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transcript> {
        Ok(Transcript {
            id: row.get(0)?,
            session_id: row.get(1)?,
            speaker: row.get(2)?,
            text: row.get(3)?,
            lang: row.get(4)?,
            start_at_ms: row.get(5)?,
            end_at_ms: row.get(6)?,
        })
    }

    /// Append-only batch insert; STT delivers segments in chunks.
    pub fn add_batch(
        &self,
        session_id: &str,
        segments: &[TranscriptSegment],
    ) -> Result<Vec<Transcript>> {
        let backend = self.ctx.backend();
        let cipher = self.ctx.cipher();

        let mut out = Vec::with_capacity(segments.len());
        for segment in segments {
            let id = new_id();
            let sealed_speaker = cipher.encrypt_field(&segment.speaker, TAG_SPEAKER)?;
            let sealed_text = cipher.encrypt_field(&segment.text, TAG_TEXT)?;

            match backend {
                Backend::Local => self
                    .ctx
                    .with_local(|conn| {
                        conn.execute(
                            r#"INSERT INTO transcripts (id, session_id, speaker, text, lang, start_at, end_at)
                               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                            params![
                                id,
                                session_id,
                                sealed_speaker,
                                sealed_text,
                                segment.lang,
                                segment.start_at_ms,
                                segment.end_at_ms
                            ],
                        )?;
                        Ok(())
                    })
                    .map_err(storage_error(ENTITY, "create"))?,
                Backend::Remote => {
                    let doc = json!({
                        "id": id,
                        "sessionId": session_id,
                        "speaker": sealed_speaker,
                        "text": sealed_text,
                        "lang": segment.lang,
                        "start_at": segment.start_at_ms,
                        "end_at": segment.end_at_ms,
                    });
                    self.ctx
                        .remote()
                        .insert_one(COLLECTION, doc)
                        .map_err(storage_error(ENTITY, "create"))?;
                }
            }

            out.push(Transcript {
                id,
                session_id: session_id.to_string(),
                speaker: segment.speaker.clone(),
                text: segment.text.clone(),
                lang: segment.lang.clone(),
                start_at_ms: segment.start_at_ms,
                end_at_ms: segment.end_at_ms,
            });
        }

        Ok(out)
    }

    fn list_in(&self, backend: Backend, session_id: &str) -> Result<Vec<Transcript>> {
        let transcripts = match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let mut stmt = conn.prepare(
                        r#"SELECT id, session_id, speaker, text, lang, start_at, end_at
                           FROM transcripts WHERE session_id = ?1 ORDER BY start_at ASC"#,
                    )?;
                    let rows = stmt.query_map(params![session_id], Self::row_to_transcript)?;
                    let mut out = Vec::new();
                    for row in rows {
                        out.push(row?);
                    }
                    Ok(out)
                })
                .map_err(storage_error(ENTITY, "find_by_session"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("sessionId", session_id);
                let docs = self
                    .ctx
                    .remote()
                    .find(COLLECTION, &filter, Some(("start_at", SortOrder::Asc)))
                    .map_err(storage_error(ENTITY, "find_by_session"))?;
                let mut out = Vec::with_capacity(docs.len());
                for doc in docs {
                    out.push(
                        serde_json::from_value(doc)
                            .map_err(|e| storage_error(ENTITY, "find_by_session")(e.into()))?,
                    );
                }
                out
            }
        };

        Ok(transcripts.into_iter().map(|t| self.decrypt(t)).collect())
    }

    pub fn list_by_session(&self, session_id: &str) -> Result<Vec<Transcript>> {
        self.list_in(self.ctx.backend(), session_id)
    }

    pub fn delete_by_session(&self, session_id: &str) -> Result<u64> {
        match self.ctx.backend() {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let deleted = conn.execute(
                        r#"DELETE FROM transcripts WHERE session_id = ?1"#,
                        params![session_id],
                    )?;
                    Ok(deleted as u64)
                })
                .map_err(storage_error(ENTITY, "delete_by_session")),
            Backend::Remote => {
                let filter = Filter::new().eq("sessionId", session_id);
                self.ctx
                    .remote()
                    .delete_many(COLLECTION, &filter)
                    .map_err(storage_error(ENTITY, "delete_by_session"))
            }
        }
    }

    pub(crate) fn list_local_by_session(&self, session_id: &str) -> Result<Vec<Transcript>> {
        self.list_in(Backend::Local, session_id)
    }

    pub(crate) fn upsert_remote(&self, transcript: &Transcript) -> Result<()> {
        let cipher = self.ctx.cipher();
        let sealed_speaker = cipher.encrypt_field(&transcript.speaker, TAG_SPEAKER)?;
        let sealed_text = cipher.encrypt_field(&transcript.text, TAG_TEXT)?;

        let filter = Filter::new()
            .eq("id", transcript.id.as_str())
            .eq("sessionId", transcript.session_id.as_str());
        let patch = json!({
            "speaker": sealed_speaker,
            "text": sealed_text,
            "lang": transcript.lang,
            "start_at": transcript.start_at_ms,
            "end_at": transcript.end_at_ms,
        });
        self.ctx
            .remote()
            .update_one(COLLECTION, &filter, patch, true)
            .map_err(storage_error(ENTITY, "upsert"))?;
        Ok(())
    }
}
