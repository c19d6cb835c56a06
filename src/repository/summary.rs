use std::sync::Arc;

use anyhow::Result;
use rusqlite::params;
use serde_json::json;

use crate::models::{new_id, now_ms, Summary};
use crate::store::remote::{Filter, SortOrder};

use super::{storage_error, Backend, StoreContext};

const ENTITY: &str = "summary";
const COLLECTION: &str = "summaries";

const TAG_TLDR: &str = "summary.tldr";
const TAG_TEXT: &str = "summary.text";
const TAG_BULLET: &str = "summary.bullet_json";
const TAG_ACTION: &str = "summary.action_json";

#[derive(Clone, Debug, Default)]
pub struct SummaryDraft {
    pub tldr: String,
    pub text: String,
    pub bullet_json: String,
    pub action_json: String,
    pub model: Option<String>,
    pub tokens_used: Option<i64>,
}

pub struct SummaryRepository {
    ctx: Arc<StoreContext>,
}

impl SummaryRepository {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }

    fn decrypt(&self, mut summary: Summary) -> Summary {
        let cipher = self.ctx.cipher();
        summary.tldr = cipher.decrypt_field_or_raw(&summary.tldr, TAG_TLDR);
        summary.text = cipher.decrypt_field_or_raw(&summary.text, TAG_TEXT);
        summary.bullet_json = cipher.decrypt_field_or_raw(&summary.bullet_json, TAG_BULLET);
        summary.action_json = cipher.decrypt_field_or_raw(&summary.action_json, TAG_ACTION);
        summary
    }

    fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<Summary> {
        Ok(Summary {
            id: row.get(0)?,
            session_id: row.get(1)?,
            tldr: row.get(2)?,
            text: row.get(3)?,
            bullet_json: row.get(4)?,
            action_json: row.get(5)?,
            model: row.get(6)?,
            tokens_used: row.get(7)?,
            generated_at_ms: row.get(8)?,
        })
    }

    pub fn add(&self, session_id: &str, draft: &SummaryDraft) -> Result<Summary> {
        let backend = self.ctx.backend();
        let id = new_id();
        let now = now_ms();

        let cipher = self.ctx.cipher();
        let sealed_tldr = cipher.encrypt_field(&draft.tldr, TAG_TLDR)?;
        let sealed_text = cipher.encrypt_field(&draft.text, TAG_TEXT)?;
        let sealed_bullet = cipher.encrypt_field(&draft.bullet_json, TAG_BULLET)?;
        let sealed_action = cipher.encrypt_field(&draft.action_json, TAG_ACTION)?;

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute(
                        r#"INSERT INTO summaries
                           (id, session_id, tldr, text, bullet_json, action_json, model, tokens_used, generated_at)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
                        params![
                            id,
                            session_id,
                            sealed_tldr,
                            sealed_text,
                            sealed_bullet,
                            sealed_action,
                            draft.model,
                            draft.tokens_used,
                            now
                        ],
                    )?;
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "create"))?,
            Backend::Remote => {
                let doc = json!({
                    "id": id,
                    "sessionId": session_id,
                    "tldr": sealed_tldr,
                    "text": sealed_text,
                    "bullet_json": sealed_bullet,
                    "action_json": sealed_action,
                    "model": draft.model,
                    "tokens_used": draft.tokens_used,
                    "generated_at": now,
                });
                self.ctx
                    .remote()
                    .insert_one(COLLECTION, doc)
                    .map_err(storage_error(ENTITY, "create"))?;
            }
        }

        Ok(Summary {
            id,
            session_id: session_id.to_string(),
            tldr: draft.tldr.clone(),
            text: draft.text.clone(),
            bullet_json: draft.bullet_json.clone(),
            action_json: draft.action_json.clone(),
            model: draft.model.clone(),
            tokens_used: draft.tokens_used,
            generated_at_ms: now,
        })
    }

    fn list_in(&self, backend: Backend, session_id: &str) -> Result<Vec<Summary>> {
        let summaries = match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let mut stmt = conn.prepare(
                        r#"SELECT id, session_id, tldr, text, bullet_json, action_json, model, tokens_used, generated_at
                           FROM summaries WHERE session_id = ?1 ORDER BY generated_at ASC"#,
                    )?;
                    let rows = stmt.query_map(params![session_id], Self::row_to_summary)?;
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
                    .find(COLLECTION, &filter, Some(("generated_at", SortOrder::Asc)))
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

        Ok(summaries.into_iter().map(|s| self.decrypt(s)).collect())
    }

    pub fn list_by_session(&self, session_id: &str) -> Result<Vec<Summary>> {
        self.list_in(self.ctx.backend(), session_id)
    }

    /// The summary with the greatest `generated_at`.
    pub fn latest_by_session(&self, session_id: &str) -> Result<Option<Summary>> {
        Ok(self.list_by_session(session_id)?.into_iter().last())
    }

    pub fn delete_by_session(&self, session_id: &str) -> Result<u64> {
        match self.ctx.backend() {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let deleted = conn.execute(
                        r#"DELETE FROM summaries WHERE session_id = ?1"#,
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

    pub(crate) fn list_local_by_session(&self, session_id: &str) -> Result<Vec<Summary>> {
        self.list_in(Backend::Local, session_id)
    }

    pub(crate) fn upsert_remote(&self, summary: &Summary) -> Result<()> {
        let cipher = self.ctx.cipher();
        let sealed_tldr = cipher.encrypt_field(&summary.tldr, TAG_TLDR)?;
        let sealed_text = cipher.encrypt_field(&summary.text, TAG_TEXT)?;
        let sealed_bullet = cipher.encrypt_field(&summary.bullet_json, TAG_BULLET)?;
        let sealed_action = cipher.encrypt_field(&summary.action_json, TAG_ACTION)?;

        let filter = Filter::new()
            .eq("id", summary.id.as_str())
            .eq("sessionId", summary.session_id.as_str());
        let patch = json!({
            "tldr": sealed_tldr,
            "text": sealed_text,
            "bullet_json": sealed_bullet,
            "action_json": sealed_action,
            "model": summary.model,
            "tokens_used": summary.tokens_used,
            "generated_at": summary.generated_at_ms,
        });
        self.ctx
            .remote()
            .update_one(COLLECTION, &filter, patch, true)
            .map_err(storage_error(ENTITY, "upsert"))?;
        Ok(())
    }
}
