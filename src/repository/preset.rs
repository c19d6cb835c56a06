use std::sync::Arc;

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde_json::json;

use crate::models::{new_id, now_ms, Preset};
use crate::store::remote::{Filter, SortOrder};

use super::{storage_error, Backend, StoreContext};

const ENTITY: &str = "preset";
const COLLECTION: &str = "presets";

const TAG_TITLE: &str = "preset.title";
const TAG_PROMPT: &str = "preset.prompt";

pub struct PresetRepository {
    ctx: Arc<StoreContext>,
}

impl PresetRepository {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }

    fn decrypt(&self, mut preset: Preset) -> Preset {
        let cipher = self.ctx.cipher();
        preset.title = cipher.decrypt_field_or_raw(&preset.title, TAG_TITLE);
        preset.prompt = cipher.decrypt_field_or_raw(&preset.prompt, TAG_PROMPT);
        preset
    }

    fn row_to_preset(row: &rusqlite::Row<'_>) -> rusqlite::Result<Preset> {
        Ok(Preset {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            prompt: row.get(3)?,
            is_default: row.get::<_, i64>(4)? != 0,
            created_at_ms: row.get(5)?,
            updated_at_ms: row.get(6)?,
        })
    }

    fn list_in(&self, backend: Backend, uid: &str) -> Result<Vec<Preset>> {
        let presets = match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let mut stmt = conn.prepare(
                        r#"SELECT id, uid, title, prompt, is_default, created_at, updated_at
                           FROM presets WHERE uid = ?1 ORDER BY created_at ASC"#,
                    )?;
                    let rows = stmt.query_map(params![uid], Self::row_to_preset)?;
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
                    .find(COLLECTION, &filter, Some(("createdAt", SortOrder::Asc)))
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

        Ok(presets.into_iter().map(|p| self.decrypt(p)).collect())
    }

    pub fn list(&self) -> Result<Vec<Preset>> {
        self.list_in(self.ctx.backend(), &self.ctx.owner_id())
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Preset>> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();

        let preset = match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let row = conn
                        .query_row(
                            r#"SELECT id, uid, title, prompt, is_default, created_at, updated_at
                               FROM presets WHERE id = ?1 AND uid = ?2"#,
                            params![id, uid],
                            Self::row_to_preset,
                        )
                        .optional()?;
                    Ok(row)
                })
                .map_err(storage_error(ENTITY, "find_by_id"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("id", id).eq("userId", uid.as_str());
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

        Ok(preset.map(|p| self.decrypt(p)))
    }

    pub fn create(&self, title: &str, prompt: &str) -> Result<Preset> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();
        let id = new_id();
        let now = now_ms();

        let cipher = self.ctx.cipher();
        let sealed_title = cipher.encrypt_field(title, TAG_TITLE)?;
        let sealed_prompt = cipher.encrypt_field(prompt, TAG_PROMPT)?;

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute(
                        r#"INSERT INTO presets (id, uid, title, prompt, is_default, created_at, updated_at)
                           VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)"#,
                        params![id, uid, sealed_title, sealed_prompt, now],
                    )?;
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "create"))?,
            Backend::Remote => {
                let doc = json!({
                    "id": id,
                    "userId": uid,
                    "title": sealed_title,
                    "prompt": sealed_prompt,
                    "isDefault": false,
                    "createdAt": now,
                    "updatedAt": now,
                });
                self.ctx
                    .remote()
                    .insert_one(COLLECTION, doc)
                    .map_err(storage_error(ENTITY, "create"))?;
            }
        }

        Ok(Preset {
            id,
            user_id: uid,
            title: title.to_string(),
            prompt: prompt.to_string(),
            is_default: false,
            created_at_ms: now,
            updated_at_ms: now,
        })
    }

    pub fn update(&self, id: &str, title: &str, prompt: &str) -> Result<()> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();
        let now = now_ms();

        let cipher = self.ctx.cipher();
        let sealed_title = cipher.encrypt_field(title, TAG_TITLE)?;
        let sealed_prompt = cipher.encrypt_field(prompt, TAG_PROMPT)?;

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute(
                        r#"UPDATE presets SET title = ?3, prompt = ?4, updated_at = ?5
                           WHERE id = ?1 AND uid = ?2"#,
                        params![id, uid, sealed_title, sealed_prompt, now],
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
                        json!({
                            "title": sealed_title,
                            "prompt": sealed_prompt,
                            "updatedAt": now,
                        }),
                        false,
                    )
                    .map_err(storage_error(ENTITY, "update"))?;
            }
        }
        Ok(())
    }

    /// Marks one preset as the default, clearing the flag on every other
    /// preset of the same user first so at most one default survives.
    pub fn set_as_default(&self, id: &str) -> Result<()> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();
        let now = now_ms();

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute_batch("BEGIN IMMEDIATE;")?;
                    let result: Result<()> = (|| {
                        conn.execute(
                            r#"UPDATE presets SET is_default = 0 WHERE uid = ?1 AND id != ?2"#,
                            params![uid, id],
                        )?;
                        conn.execute(
                            r#"UPDATE presets SET is_default = 1, updated_at = ?3
                               WHERE id = ?1 AND uid = ?2"#,
                            params![id, uid, now],
                        )?;
                        Ok(())
                    })();

                    match result {
                        Ok(()) => {
                            conn.execute_batch("COMMIT;")?;
                            Ok(())
                        }
                        Err(e) => {
                            let _ = conn.execute_batch("ROLLBACK;");
                            Err(e)
                        }
                    }
                })
                .map_err(storage_error(ENTITY, "set_as_default"))?,
            Backend::Remote => {
                // Clear first, then set: a crash in between leaves zero
                // defaults, never two.
                let defaults = self
                    .ctx
                    .remote()
                    .find(
                        COLLECTION,
                        &Filter::new().eq("userId", uid.as_str()).eq("isDefault", true),
                        None,
                    )
                    .map_err(storage_error(ENTITY, "set_as_default"))?;
                for doc in defaults {
                    let Some(other_id) = doc.get("id").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    if other_id == id {
                        continue;
                    }
                    let filter = Filter::new().eq("id", other_id).eq("userId", uid.as_str());
                    self.ctx
                        .remote()
                        .update_one(COLLECTION, &filter, json!({"isDefault": false}), false)
                        .map_err(storage_error(ENTITY, "set_as_default"))?;
                }

                let filter = Filter::new().eq("id", id).eq("userId", uid.as_str());
                self.ctx
                    .remote()
                    .update_one(
                        COLLECTION,
                        &filter,
                        json!({"isDefault": true, "updatedAt": now}),
                        false,
                    )
                    .map_err(storage_error(ENTITY, "set_as_default"))?;
            }
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute(
                        r#"DELETE FROM presets WHERE id = ?1 AND uid = ?2"#,
                        params![id, uid],
                    )?;
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "delete"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("id", id).eq("userId", uid.as_str());
                self.ctx
                    .remote()
                    .delete_many(COLLECTION, &filter)
                    .map_err(storage_error(ENTITY, "delete"))?;
            }
        }
        Ok(())
    }

    pub fn delete_by_owner(&self) -> Result<u64> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let deleted =
                        conn.execute(r#"DELETE FROM presets WHERE uid = ?1"#, params![uid])?;
                    Ok(deleted as u64)
                })
                .map_err(storage_error(ENTITY, "delete_by_owner")),
            Backend::Remote => {
                let filter = Filter::new().eq("userId", uid.as_str());
                self.ctx
                    .remote()
                    .delete_many(COLLECTION, &filter)
                    .map_err(storage_error(ENTITY, "delete_by_owner"))
            }
        }
    }

    pub(crate) fn list_local_for(&self, uid: &str) -> Result<Vec<Preset>> {
        self.list_in(Backend::Local, uid)
    }

    /// Id-preserving remote upsert used by the migration coordinator.
    pub(crate) fn upsert_remote(&self, preset: &Preset) -> Result<()> {
        let cipher = self.ctx.cipher();
        let sealed_title = cipher.encrypt_field(&preset.title, TAG_TITLE)?;
        let sealed_prompt = cipher.encrypt_field(&preset.prompt, TAG_PROMPT)?;

        let filter = Filter::new()
            .eq("id", preset.id.as_str())
            .eq("userId", preset.user_id.as_str());
        let patch = json!({
            "title": sealed_title,
            "prompt": sealed_prompt,
            "isDefault": preset.is_default,
            "createdAt": preset.created_at_ms,
            "updatedAt": preset.updated_at_ms,
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
                conn.execute(r#"DELETE FROM presets WHERE uid = ?1"#, params![uid])?;
                Ok(())
            })
            .map_err(storage_error(ENTITY, "delete_by_owner"))
    }
}
