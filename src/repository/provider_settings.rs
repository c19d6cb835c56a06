use std::sync::Arc;

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde_json::json;

use crate::models::{new_id, now_ms, ProviderSettings};
use crate::providers::ModelKind;
use crate::store::remote::Filter;

use super::{storage_error, Backend, StoreContext};

const ENTITY: &str = "provider_settings";
const COLLECTION: &str = "provider_settings";

fn api_key_tag(provider: &str) -> String {
    format!("provider_settings.api_key:{provider}")
}

fn selection_column(kind: ModelKind) -> &'static str {
    match kind {
        ModelKind::Llm => "selected_llm_model",
        ModelKind::Stt => "selected_stt_model",
    }
}

pub struct ProviderSettingsRepository {
    ctx: Arc<StoreContext>,
}

impl ProviderSettingsRepository {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }

    fn decrypt(&self, mut settings: ProviderSettings) -> ProviderSettings {
        let tag = api_key_tag(&settings.provider);
        settings.api_key = self
            .ctx
            .cipher()
            .decrypt_opt_or_raw(settings.api_key.as_deref(), &tag);
        settings
    }

    fn row_to_settings(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderSettings> {
        Ok(ProviderSettings {
            id: row.get(0)?,
            user_id: row.get(1)?,
            provider: row.get(2)?,
            api_key: row.get(3)?,
            selected_llm_model: row.get(4)?,
            selected_stt_model: row.get(5)?,
            created_at_ms: row.get(6)?,
            updated_at_ms: row.get(7)?,
        })
    }

    fn list_in(&self, backend: Backend, uid: &str) -> Result<Vec<ProviderSettings>> {
        let rows = match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let mut stmt = conn.prepare(
                        r#"SELECT id, uid, provider, api_key, selected_llm_model, selected_stt_model,
                                  created_at, updated_at
                           FROM provider_settings WHERE uid = ?1 ORDER BY provider ASC"#,
                    )?;
                    let rows = stmt.query_map(params![uid], Self::row_to_settings)?;
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
                    .find(COLLECTION, &filter, None)
                    .map_err(storage_error(ENTITY, "find_by_owner"))?;
                let mut out = Vec::with_capacity(docs.len());
                for doc in docs {
                    out.push(
                        serde_json::from_value(doc)
                            .map_err(|e| storage_error(ENTITY, "find_by_owner")(e.into()))?,
                    );
                }
                out.sort_by(|a: &ProviderSettings, b: &ProviderSettings| {
                    a.provider.cmp(&b.provider)
                });
                out
            }
        };

        Ok(rows.into_iter().map(|s| self.decrypt(s)).collect())
    }

    pub fn all(&self) -> Result<Vec<ProviderSettings>> {
        self.list_in(self.ctx.backend(), &self.ctx.owner_id())
    }

    pub fn get(&self, provider: &str) -> Result<Option<ProviderSettings>> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();

        let row = match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let row = conn
                        .query_row(
                            r#"SELECT id, uid, provider, api_key, selected_llm_model, selected_stt_model,
                                      created_at, updated_at
                               FROM provider_settings WHERE uid = ?1 AND provider = ?2"#,
                            params![uid, provider],
                            Self::row_to_settings,
                        )
                        .optional()?;
                    Ok(row)
                })
                .map_err(storage_error(ENTITY, "find_by_provider"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("userId", uid.as_str()).eq("provider", provider);
                let doc = self
                    .ctx
                    .remote()
                    .find_one(COLLECTION, &filter)
                    .map_err(storage_error(ENTITY, "find_by_provider"))?;
                match doc {
                    Some(doc) => Some(
                        serde_json::from_value(doc)
                            .map_err(|e| storage_error(ENTITY, "find_by_provider")(e.into()))?,
                    ),
                    None => None,
                }
            }
        };

        Ok(row.map(|s| self.decrypt(s)))
    }

    /// Upsert keyed on the `(user, provider)` natural key; there is never a
    /// second row for the same pair.
    pub fn upsert_api_key(&self, provider: &str, api_key: Option<&str>) -> Result<()> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();
        let now = now_ms();
        let sealed_key = self
            .ctx
            .cipher()
            .encrypt_opt(api_key, &api_key_tag(provider))?;

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let existing: Option<String> = conn
                        .query_row(
                            r#"SELECT id FROM provider_settings WHERE uid = ?1 AND provider = ?2"#,
                            params![uid, provider],
                            |row| row.get(0),
                        )
                        .optional()?;

                    match existing {
                        Some(id) => {
                            conn.execute(
                                r#"UPDATE provider_settings SET api_key = ?2, updated_at = ?3 WHERE id = ?1"#,
                                params![id, sealed_key, now],
                            )?;
                        }
                        None => {
                            conn.execute(
                                r#"INSERT INTO provider_settings
                                   (id, uid, provider, api_key, selected_llm_model, selected_stt_model, created_at, updated_at)
                                   VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5, ?5)"#,
                                params![new_id(), uid, provider, sealed_key, now],
                            )?;
                        }
                    }
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "upsert"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("userId", uid.as_str()).eq("provider", provider);
                let outcome = self
                    .ctx
                    .remote()
                    .update_one(
                        COLLECTION,
                        &filter,
                        json!({"apiKey": sealed_key, "updatedAt": now}),
                        true,
                    )
                    .map_err(storage_error(ENTITY, "upsert"))?;
                if outcome.upserted_id.is_some() {
                    self.ctx
                        .remote()
                        .update_one(
                            COLLECTION,
                            &filter,
                            json!({"createdAt": now}),
                            false,
                        )
                        .map_err(storage_error(ENTITY, "upsert"))?;
                }
            }
        }
        Ok(())
    }

    pub fn remove(&self, provider: &str) -> Result<bool> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let deleted = conn.execute(
                        r#"DELETE FROM provider_settings WHERE uid = ?1 AND provider = ?2"#,
                        params![uid, provider],
                    )?;
                    Ok(deleted > 0)
                })
                .map_err(storage_error(ENTITY, "delete")),
            Backend::Remote => {
                let filter = Filter::new().eq("userId", uid.as_str()).eq("provider", provider);
                let deleted = self
                    .ctx
                    .remote()
                    .delete_many(COLLECTION, &filter)
                    .map_err(storage_error(ENTITY, "delete"))?;
                Ok(deleted > 0)
            }
        }
    }

    /// Records the global selection for one model type on the owning
    /// provider's row, clearing that column everywhere else so the selection
    /// is unambiguous.
    pub fn set_selected_model(
        &self,
        kind: ModelKind,
        provider: &str,
        model_id: &str,
    ) -> Result<()> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();
        let now = now_ms();
        let column = selection_column(kind);

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute_batch("BEGIN IMMEDIATE;")?;
                    let result: Result<()> = (|| {
                        conn.execute(
                            &format!(
                                "UPDATE provider_settings SET {column} = NULL WHERE uid = ?1 AND provider != ?2"
                            ),
                            params![uid, provider],
                        )?;
                        conn.execute(
                            &format!(
                                "UPDATE provider_settings SET {column} = ?3, updated_at = ?4
                                 WHERE uid = ?1 AND provider = ?2"
                            ),
                            params![uid, provider, model_id, now],
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
                .map_err(storage_error(ENTITY, "set_selected_model"))?,
            Backend::Remote => {
                let others = self
                    .ctx
                    .remote()
                    .find(COLLECTION, &Filter::new().eq("userId", uid.as_str()), None)
                    .map_err(storage_error(ENTITY, "set_selected_model"))?;
                for doc in others {
                    let Some(row_provider) = doc.get("provider").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    if row_provider == provider {
                        continue;
                    }
                    if doc.get(column).map(|v| v.is_null()).unwrap_or(true) {
                        continue;
                    }
                    let filter = Filter::new()
                        .eq("userId", uid.as_str())
                        .eq("provider", row_provider);
                    self.ctx
                        .remote()
                        .update_one(
                            COLLECTION,
                            &filter,
                            json!({column: serde_json::Value::Null}),
                            false,
                        )
                        .map_err(storage_error(ENTITY, "set_selected_model"))?;
                }

                let filter = Filter::new().eq("userId", uid.as_str()).eq("provider", provider);
                self.ctx
                    .remote()
                    .update_one(
                        COLLECTION,
                        &filter,
                        json!({column: model_id, "updatedAt": now}),
                        false,
                    )
                    .map_err(storage_error(ENTITY, "set_selected_model"))?;
            }
        }
        Ok(())
    }

    pub fn clear_selected_model(&self, kind: ModelKind) -> Result<()> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();
        let column = selection_column(kind);

        match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute(
                        &format!("UPDATE provider_settings SET {column} = NULL WHERE uid = ?1"),
                        params![uid],
                    )?;
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "clear_selected_model"))?,
            Backend::Remote => {
                let rows = self
                    .ctx
                    .remote()
                    .find(COLLECTION, &Filter::new().eq("userId", uid.as_str()), None)
                    .map_err(storage_error(ENTITY, "clear_selected_model"))?;
                for doc in rows {
                    if doc.get(column).map(|v| v.is_null()).unwrap_or(true) {
                        continue;
                    }
                    let Some(row_provider) = doc.get("provider").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let filter = Filter::new()
                        .eq("userId", uid.as_str())
                        .eq("provider", row_provider);
                    self.ctx
                        .remote()
                        .update_one(
                            COLLECTION,
                            &filter,
                            json!({column: serde_json::Value::Null}),
                            false,
                        )
                        .map_err(storage_error(ENTITY, "clear_selected_model"))?;
                }
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
                    let deleted = conn.execute(
                        r#"DELETE FROM provider_settings WHERE uid = ?1"#,
                        params![uid],
                    )?;
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

    pub(crate) fn list_local_for(&self, uid: &str) -> Result<Vec<ProviderSettings>> {
        self.list_in(Backend::Local, uid)
    }

    /// Migration upsert; runs through the same `(user, provider)` natural
    /// key as the steady-state path, so duplicates cannot appear.
    pub(crate) fn upsert_remote(&self, settings: &ProviderSettings) -> Result<()> {
        let sealed_key = self
            .ctx
            .cipher()
            .encrypt_opt(settings.api_key.as_deref(), &api_key_tag(&settings.provider))?;

        let filter = Filter::new()
            .eq("userId", settings.user_id.as_str())
            .eq("provider", settings.provider.as_str());
        let patch = json!({
            "apiKey": sealed_key,
            "selected_llm_model": settings.selected_llm_model,
            "selected_stt_model": settings.selected_stt_model,
            "createdAt": settings.created_at_ms,
            "updatedAt": settings.updated_at_ms,
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
                conn.execute(
                    r#"DELETE FROM provider_settings WHERE uid = ?1"#,
                    params![uid],
                )?;
                Ok(())
            })
            .map_err(storage_error(ENTITY, "delete_by_owner"))
    }
}
