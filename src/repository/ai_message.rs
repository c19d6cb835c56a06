use std::sync::Arc;

use anyhow::Result;
use rusqlite::params;
use serde_json::json;

use crate::models::{new_id, now_ms, AiMessage};
use crate::store::remote::{Filter, SortOrder};

use super::{storage_error, Backend, StoreContext};

const ENTITY: &str = "ai_message";
const COLLECTION: &str = "ai_messages";

const TAG_CONTENT: &str = "ai_message.content";

pub struct AiMessageRepository {
    ctx: Arc<StoreContext>,
}

impl AiMessageRepository {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }

    fn decrypt(&self, mut message: AiMessage) -> AiMessage {
        message.content = self
            .ctx
            .cipher()
            .decrypt_field_or_raw(&message.content, TAG_CONTENT);
        message
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<AiMessage> {
        Ok(AiMessage {
            id: row.get(0)?,
            session_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            tokens: row.get(4)?,
            model: row.get(5)?,
            sent_at_ms: row.get(6)?,
        })
    }

    /// Append-only: messages are never edited after insertion.
    pub fn add(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        tokens: Option<i64>,
        model: Option<&str>,
    ) -> Result<AiMessage> {
        let backend = self.ctx.backend();
        let id = new_id();
        let now = now_ms();
        let sealed_content = self.ctx.cipher().encrypt_field(content, TAG_CONTENT)?;

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute(
                        r#"INSERT INTO ai_messages (id, session_id, role, content, tokens, model, sent_at)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                        params![id, session_id, role, sealed_content, tokens, model, now],
                    )?;
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "create"))?,
            Backend::Remote => {
                let doc = json!({
                    "id": id,
                    "sessionId": session_id,
                    "role": role,
                    "content": sealed_content,
                    "tokens": tokens,
                    "model": model,
                    "sent_at": now,
                });
                self.ctx
                    .remote()
                    .insert_one(COLLECTION, doc)
                    .map_err(storage_error(ENTITY, "create"))?;
            }
        }

        Ok(AiMessage {
            id,
            session_id: session_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            tokens,
            model: model.map(|m| m.to_string()),
            sent_at_ms: now,
        })
    }

    fn list_in(&self, backend: Backend, session_id: &str) -> Result<Vec<AiMessage>> {
        let messages = match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let mut stmt = conn.prepare(
                        r#"SELECT id, session_id, role, content, tokens, model, sent_at
                           FROM ai_messages WHERE session_id = ?1 ORDER BY sent_at ASC"#,
                    )?;
                    let rows = stmt.query_map(params![session_id], Self::row_to_message)?;
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
                    .find(COLLECTION, &filter, Some(("sent_at", SortOrder::Asc)))
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

        Ok(messages.into_iter().map(|m| self.decrypt(m)).collect())
    }

    pub fn list_by_session(&self, session_id: &str) -> Result<Vec<AiMessage>> {
        self.list_in(self.ctx.backend(), session_id)
    }

    /// Total tokens recorded for one session; rows without a token count
    /// contribute zero.
    pub fn sum_tokens_by_session(&self, session_id: &str) -> Result<i64> {
        match self.ctx.backend() {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let sum: i64 = conn.query_row(
                        r#"SELECT COALESCE(SUM(tokens), 0) FROM ai_messages WHERE session_id = ?1"#,
                        params![session_id],
                        |row| row.get(0),
                    )?;
                    Ok(sum)
                })
                .map_err(storage_error(ENTITY, "sum_tokens")),
            Backend::Remote => {
                let filter = Filter::new().eq("sessionId", session_id);
                self.ctx
                    .remote()
                    .sum(COLLECTION, &filter, "tokens")
                    .map_err(storage_error(ENTITY, "sum_tokens"))
            }
        }
    }

    pub fn count_by_session(&self, session_id: &str) -> Result<u64> {
        match self.ctx.backend() {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let count: i64 = conn.query_row(
                        r#"SELECT COUNT(*) FROM ai_messages WHERE session_id = ?1"#,
                        params![session_id],
                        |row| row.get(0),
                    )?;
                    Ok(count as u64)
                })
                .map_err(storage_error(ENTITY, "count")),
            Backend::Remote => {
                let filter = Filter::new().eq("sessionId", session_id);
                self.ctx
                    .remote()
                    .count(COLLECTION, &filter)
                    .map_err(storage_error(ENTITY, "count"))
            }
        }
    }

    pub fn delete_by_session(&self, session_id: &str) -> Result<u64> {
        match self.ctx.backend() {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let deleted = conn.execute(
                        r#"DELETE FROM ai_messages WHERE session_id = ?1"#,
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

    pub(crate) fn list_local_by_session(&self, session_id: &str) -> Result<Vec<AiMessage>> {
        self.list_in(Backend::Local, session_id)
    }

    pub(crate) fn upsert_remote(&self, message: &AiMessage) -> Result<()> {
        let sealed_content = self.ctx.cipher().encrypt_field(&message.content, TAG_CONTENT)?;
        let filter = Filter::new()
            .eq("id", message.id.as_str())
            .eq("sessionId", message.session_id.as_str());
        let patch = json!({
            "role": message.role,
            "content": sealed_content,
            "tokens": message.tokens,
            "model": message.model,
            "sent_at": message.sent_at_ms,
        });
        self.ctx
            .remote()
            .update_one(COLLECTION, &filter, patch, true)
            .map_err(storage_error(ENTITY, "upsert"))?;
        Ok(())
    }
}
