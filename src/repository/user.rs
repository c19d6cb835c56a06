use std::sync::Arc;

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde_json::json;

use crate::auth::AuthUser;
use crate::models::{now_ms, User};
use crate::store::remote::Filter;

use super::{storage_error, Backend, StoreContext};

const ENTITY: &str = "user";
const COLLECTION: &str = "users";

const TAG_EMAIL: &str = "user.email";
const TAG_DISPLAY_NAME: &str = "user.display_name";

pub struct UserRepository {
    ctx: Arc<StoreContext>,
}

impl UserRepository {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }

    fn decrypt(&self, mut user: User) -> User {
        let cipher = self.ctx.cipher();
        user.email = cipher.decrypt_opt_or_raw(user.email.as_deref(), TAG_EMAIL);
        user.display_name = cipher.decrypt_opt_or_raw(user.display_name.as_deref(), TAG_DISPLAY_NAME);
        user
    }

    fn find_in(&self, backend: Backend, uid: &str) -> Result<Option<User>> {
        let user = match backend {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    let row = conn
                        .query_row(
                            r#"SELECT uid, email, display_name, role, has_migrated, created_at, updated_at
                               FROM users WHERE uid = ?1"#,
                            params![uid],
                            |row| {
                                Ok(User {
                                    uid: row.get(0)?,
                                    email: row.get(1)?,
                                    display_name: row.get(2)?,
                                    role: row.get(3)?,
                                    has_migrated: row.get::<_, i64>(4)? != 0,
                                    created_at_ms: row.get(5)?,
                                    updated_at_ms: row.get(6)?,
                                })
                            },
                        )
                        .optional()?;
                    Ok(row)
                })
                .map_err(storage_error(ENTITY, "find_by_id"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("uid", uid);
                let doc = self
                    .ctx
                    .remote()
                    .find_one(COLLECTION, &filter)
                    .map_err(storage_error(ENTITY, "find_by_id"))?;
                match doc {
                    Some(doc) => Some(
                        serde_json::from_value(doc).map_err(|e| {
                            storage_error(ENTITY, "find_by_id")(e.into())
                        })?,
                    ),
                    None => None,
                }
            }
        };

        Ok(user.map(|u| self.decrypt(u)))
    }

    pub fn find_by_id(&self, uid: &str) -> Result<Option<User>> {
        self.find_in(self.ctx.backend(), uid)
    }

    /// Creates the user record on first sign-in (or local bootstrap) and
    /// returns the existing one on subsequent calls.
    pub fn find_or_create(&self, auth_user: &AuthUser) -> Result<User> {
        let backend = self.ctx.backend();
        if let Some(existing) = self.find_in(backend, &auth_user.user_id)? {
            return Ok(existing);
        }

        let now = now_ms();
        let cipher = self.ctx.cipher();
        let email = cipher.encrypt_opt(auth_user.email.as_deref(), TAG_EMAIL)?;
        let display_name = cipher.encrypt_opt(auth_user.display_name.as_deref(), TAG_DISPLAY_NAME)?;

        match backend {
            Backend::Local => {
                self.ctx
                    .with_local(|conn| {
                        conn.execute(
                            r#"INSERT INTO users (uid, email, display_name, role, has_migrated, created_at, updated_at)
                               VALUES (?1, ?2, ?3, NULL, 0, ?4, ?4)"#,
                            params![auth_user.user_id, email, display_name, now],
                        )?;
                        Ok(())
                    })
                    .map_err(storage_error(ENTITY, "create"))?;
            }
            Backend::Remote => {
                let doc = json!({
                    "uid": auth_user.user_id,
                    "email": email,
                    "displayName": display_name,
                    "role": serde_json::Value::Null,
                    "hasMigrated": false,
                    "createdAt": now,
                    "updatedAt": now,
                });
                self.ctx
                    .remote()
                    .insert_one(COLLECTION, doc)
                    .map_err(storage_error(ENTITY, "create"))?;
            }
        }

        Ok(User {
            uid: auth_user.user_id.clone(),
            email: auth_user.email.clone(),
            display_name: auth_user.display_name.clone(),
            role: None,
            has_migrated: false,
            created_at_ms: now,
            updated_at_ms: now,
        })
    }

    /// Profile edit for the current user.
    pub fn update_profile(
        &self,
        display_name: Option<&str>,
        role: Option<&str>,
    ) -> Result<Option<User>> {
        let backend = self.ctx.backend();
        let uid = self.ctx.owner_id();
        let now = now_ms();
        let sealed_name = self
            .ctx
            .cipher()
            .encrypt_opt(display_name, TAG_DISPLAY_NAME)?;

        match backend {
            Backend::Local => {
                self.ctx
                    .with_local(|conn| {
                        if let Some(name) = &sealed_name {
                            conn.execute(
                                r#"UPDATE users SET display_name = ?2, updated_at = ?3 WHERE uid = ?1"#,
                                params![uid, name, now],
                            )?;
                        }
                        if let Some(role) = role {
                            conn.execute(
                                r#"UPDATE users SET role = ?2, updated_at = ?3 WHERE uid = ?1"#,
                                params![uid, role, now],
                            )?;
                        }
                        Ok(())
                    })
                    .map_err(storage_error(ENTITY, "update"))?;
            }
            Backend::Remote => {
                let mut patch = serde_json::Map::new();
                if let Some(name) = &sealed_name {
                    patch.insert("displayName".to_string(), json!(name));
                }
                if let Some(role) = role {
                    patch.insert("role".to_string(), json!(role));
                }
                patch.insert("updatedAt".to_string(), json!(now));

                let filter = Filter::new().eq("uid", uid.as_str());
                self.ctx
                    .remote()
                    .update_one(COLLECTION, &filter, serde_json::Value::Object(patch), false)
                    .map_err(storage_error(ENTITY, "update"))?;
            }
        }

        self.find_in(backend, &uid)
    }

    /// Removes the user row itself. Cascading deletion of owned entities is
    /// orchestrated by the core (see `DataCore::delete_account`).
    pub fn delete(&self, uid: &str) -> Result<()> {
        match self.ctx.backend() {
            Backend::Local => self
                .ctx
                .with_local(|conn| {
                    conn.execute(r#"DELETE FROM users WHERE uid = ?1"#, params![uid])?;
                    Ok(())
                })
                .map_err(storage_error(ENTITY, "delete"))?,
            Backend::Remote => {
                let filter = Filter::new().eq("uid", uid);
                self.ctx
                    .remote()
                    .delete_many(COLLECTION, &filter)
                    .map_err(storage_error(ENTITY, "delete"))?;
            }
        }
        Ok(())
    }

    /// The migration gate lives on the local row regardless of the active
    /// backend.
    pub(crate) fn find_local(&self, uid: &str) -> Result<Option<User>> {
        self.find_in(Backend::Local, uid)
    }

    pub(crate) fn set_migration_complete(&self, uid: &str) -> Result<()> {
        self.ctx
            .with_local(|conn| {
                conn.execute(
                    r#"UPDATE users SET has_migrated = 1, updated_at = ?2 WHERE uid = ?1"#,
                    params![uid, now_ms()],
                )?;
                Ok(())
            })
            .map_err(storage_error(ENTITY, "set_migration_complete"))
    }
}
