use std::sync::Arc;

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde_json::json;

use crate::models::{new_id, now_ms, Session};
use crate::store::remote::{Filter, SortOrder};

use super::{storage_error, Backend, StoreContext};

const ENTITY: &str = "session";
const COLLECTION: &str = "sessions";

const TAG_TITLE: &str = "session.title";

/// Session-scoped child tables removed alongside their parent.
const CHILD_TABLES: [&str; 3] = ["ai_messages", "summaries", "transcripts"];
const CHILD_COLLECTIONS: [&str; 3] = ["ai_messages", "summaries", "transcripts"];

pub struct SessionRepository {
    ctx: Arc<StoreContext>,
}

impl SessionRepository {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }

    fn decrypt(&self, mut session: Session) -> Session {
        session.title = self
            .ctx
            .cipher()
            .decrypt_field_or_raw(&session.title, TAG_TITLE);
        session
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            session_type: row.get(3)?,
            started_at_ms: row.get(4)?,
            ended_at_ms: row.get(5)?,
            created_at_ms: row.get(6)?,
            updated_at_ms: row.get(7)?,
        })
    }

    pub fn create(&self, session_type: &str, title: &str) -> Result<Session> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();
        let id = new_id();
        let now = now_ms();
        let sealed_title = self.ctx.cipher().encrypt_field(title, TAG_TITLE)?;

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute(
                        r#"INSERT INTO sessions (id, uid, title, session_type, started_at, ended_at, created_at, updated_at)
                           VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?5, ?5)"#,
                        params![id, uid, sealed_title, session_type, now],
                    )?;
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "create"))?,
            Backend::Remote => {
                let doc = json!({
                    "id": id,
                    "userId": uid,
                    "title": sealed_title,
                    "session_type": session_type,
                    "started_at": now,
                    "ended_at": serde_json::Value::Null,
                    "createdAt": now,
                    "updatedAt": now,
                });
                self.ctx
                    .remote()
                    .insert_one(COLLECTION, doc)
                    .map_err(storage_error(ENTITY, "create"))?;
            }
        }

        Ok(Session {
            id,
            user_id: uid,
            title: title.to_string(),
            session_type: session_type.to_string(),
            started_at_ms: now,
            ended_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        })
    }

    fn find_in(&self, backend: Backend, uid: &str, id: &str) -> Result<Option<Session>> {
        let session = match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let row = conn
                        .query_row(
                            r#"SELECT id, uid, title, session_type, started_at, ended_at, created_at, updated_at
                               FROM sessions WHERE id = ?1 AND uid = ?2"#,
                            params![id, uid],
                            Self::row_to_session,
                        )
                        .optional()?;
                    Ok(row)
                })
                .map_err(storage_error(ENTITY, "find_by_id"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("id", id).eq("userId", uid);
                let doc = self
                    .ctx
                    .remote()
                    .find_one(COLLECTION, &filter)
                    .map_err(storage_error(ENTITY, "find_by_id"))?;
                match doc {
                    Some(doc) => Some(
                        serde_json::from_value(doc)
                            .map_err(|e| storage_error(ENTITY, "find_by_id")(e.into()))?,
                    ),
                    None => None,
                }
            }
        };

        Ok(session.map(|s| self.decrypt(s)))
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Session>> {
        self.find_in(self.ctx.backend(), &self.ctx.owner_id(), id)
    }

    fn list_in(&self, backend: Backend, uid: &str) -> Result<Vec<Session>> {
        let sessions = match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let mut stmt = conn.prepare(
                        r#"SELECT id, uid, title, session_type, started_at, ended_at, created_at, updated_at
                           FROM sessions WHERE uid = ?1 ORDER BY started_at DESC"#,
                    )?;
                    let rows = stmt.query_map(params![uid], Self::row_to_session)?;
                    let mut out = Vec::new();
                    for row in rows {
                        out.push(row?);
                    }
                    Ok(out)
                })
                .map_err(storage_error(ENTITY, "find_by_owner"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("userId", uid);
                let docs = self
                    .ctx
                    .remote()
                    .find(COLLECTION, &filter, Some(("started_at", SortOrder::Desc)))
                    .map_err(storage_error(ENTITY, "find_by_owner"))?;
                let mut out = Vec::with_capacity(docs.len());
                for doc in docs {
                    out.push(
                        serde_json::from_value(doc)
                            .map_err(|e| storage_error(ENTITY, "find_by_owner")(e.into()))?,
                    );
                }
                out
            }
        };

        Ok(sessions.into_iter().map(|s| self.decrypt(s)).collect())
    }

    pub fn list(&self) -> Result<Vec<Session>> {
        self.list_in(self.ctx.backend(), &self.ctx.owner_id())
    }

    pub fn update_title(&self, id: &str, title: &str) -> Result<()> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();
        let now = now_ms();
        let sealed_title = self.ctx.cipher().encrypt_field(title, TAG_TITLE)?;

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute(
                        r#"UPDATE sessions SET title = ?3, updated_at = ?4 WHERE id = ?1 AND uid = ?2"#,
                        params![id, uid, sealed_title, now],
                    )?;
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "update"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("id", id).eq("userId", uid.as_str());
                self.ctx
                    .remote()
                    .update_one(
                        COLLECTION,
                        &filter,
                        json!({"title": sealed_title, "updatedAt": now}),
                        false,
                    )
                    .map_err(storage_error(ENTITY, "update"))?;
            }
        }
        Ok(())
    }

    pub fn touch(&self, id: &str) -> Result<()> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();
        let now = now_ms();

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute(
                        r#"UPDATE sessions SET updated_at = ?3 WHERE id = ?1 AND uid = ?2"#,
                        params![id, uid, now],
                    )?;
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "touch"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("id", id).eq("userId", uid.as_str());
                self.ctx
                    .remote()
                    .update_one(COLLECTION, &filter, json!({"updatedAt": now}), false)
                    .map_err(storage_error(ENTITY, "touch"))?;
            }
        }
        Ok(())
    }

    /// Marks the session ended. `ended_at` is set once and never before
    /// `started_at`; ending an already-ended session is a no-op.
    pub fn end(&self, id: &str) -> Result<Option<Session>> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();

        let Some(session) = self.find_in(backend, &uid, id)? else {
            return Ok(None);
        };
        if session.ended_at_ms.is_some() {
            return Ok(Some(session));
        }

        let ended = now_ms().max(session.started_at_ms);
        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute(
                        r#"UPDATE sessions SET ended_at = ?3, updated_at = ?3
                           WHERE id = ?1 AND uid = ?2 AND ended_at IS NULL"#,
                        params![id, uid, ended],
                    )?;
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "end"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("id", id).eq("userId", uid.as_str());
                self.ctx
                    .remote()
                    .update_one(
                        COLLECTION,
                        &filter,
                        json!({"ended_at": ended, "updatedAt": ended}),
                        false,
                    )
                    .map_err(storage_error(ENTITY, "end"))?;
            }
        }

        Ok(Some(Session {
            ended_at_ms: Some(ended),
            updated_at_ms: ended,
            ..session
        }))
    }

    /// Deletes a session together with its messages, summaries and
    /// transcripts, leaving no orphaned children.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.delete_in(self.ctx.backend(), &self.ctx.owner_id(), id)
    }

    fn delete_in(&self, backend: Backend, uid: &str, id: &str) -> Result<()> {
        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    for table in CHILD_TABLES {
                        conn.execute(
                            &format!("DELETE FROM {table} WHERE session_id = ?1"),
                            params![id],
                        )?;
                    }
                    conn.execute(
                        r#"DELETE FROM sessions WHERE id = ?1 AND uid = ?2"#,
                        params![id, uid],
                    )?;
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "delete"))?,
            Backend::Remote => {
                let child_filter = Filter::new().eq("sessionId", id);
                for collection in CHILD_COLLECTIONS {
                    self.ctx
                        .remote()
                        .delete_many(collection, &child_filter)
                        .map_err(storage_error(ENTITY, "delete"))?;
                }
                let filter = Filter::new().eq("id", id).eq("userId", uid);
                self.ctx
                    .remote()
                    .delete_many(COLLECTION, &filter)
                    .map_err(storage_error(ENTITY, "delete"))?;
            }
        }
        Ok(())
    }

    /// Removes every session of the current user, children included. One
    /// backend snapshot covers the whole sweep.
    pub fn delete_by_owner(&self) -> Result<u64> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();

        let sessions = self.list_in(backend, &uid)?;
        let count = sessions.len() as u64;
        for session in &sessions {
            self.delete_in(backend, &uid, &session.id)?;
        }
        Ok(count)
    }

    pub(crate) fn list_local_for(&self, uid: &str) -> Result<Vec<Session>> {
        self.list_in(Backend::Local, uid)
    }

    /// Id-preserving remote upsert used by the migration coordinator; runs
    /// the same encryption and document layout as `create`.
    pub(crate) fn upsert_remote(&self, session: &Session) -> Result<()> {
        let sealed_title = self.ctx.cipher().encrypt_field(&session.title, TAG_TITLE)?;
        let filter = Filter::new()
            .eq("id", session.id.as_str())
            .eq("userId", session.user_id.as_str());
        let patch = json!({
            "title": sealed_title,
            "session_type": session.session_type,
            "started_at": session.started_at_ms,
            "ended_at": session.ended_at_ms,
            "createdAt": session.created_at_ms,
            "updatedAt": session.updated_at_ms,
        });
        self.ctx
            .remote()
            .update_one(COLLECTION, &filter, patch, true)
            .map_err(storage_error(ENTITY, "upsert"))?;
        Ok(())
    }

    pub(crate) fn delete_local_for(&self, uid: &str) -> Result<()> {
        self.ctx
            .with_local(|conn| {
                let mut stmt = conn.prepare(r#"SELECT id FROM sessions WHERE uid = ?1"#)?;
                let ids: Vec<String> = stmt
                    .query_map(params![uid], |row| row.get(0))?
                    .collect::<rusqlite::Result<_>>()?;

                for id in &ids {
                    for table in CHILD_TABLES {
                        conn.execute(
                            &format!("DELETE FROM {table} WHERE session_id = ?1"),
                            params![id],
                        )?;
                    }
                }
                conn.execute(r#"DELETE FROM sessions WHERE uid = ?1"#, params![uid])?;
                Ok(())
            })
            .map_err(storage_error(ENTITY, "delete_by_owner"))
    }
}
