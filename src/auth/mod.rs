use std::sync::Mutex;

/// Stable owner id used for all data written while signed out.
pub const DEFAULT_LOCAL_USER_ID: &str = "default_user";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
    pub is_logged_in: bool,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl AuthUser {
    pub fn local_default() -> Self {
        Self {
            user_id: DEFAULT_LOCAL_USER_ID.to_string(),
            is_logged_in: false,
            email: None,
            display_name: None,
        }
    }

    pub fn signed_in(user_id: &str, email: &str, display_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            is_logged_in: true,
            email: Some(email.to_string()),
            display_name: Some(display_name.to_string()),
        }
    }
}

/// Auth/session collaborator consumed by the persistence core. The embedding
/// application implements this over its real auth stack; the core only ever
/// reads a snapshot of the current user.
pub trait AuthSession: Send + Sync {
    fn current_user(&self) -> AuthUser;

    fn current_user_id(&self) -> String {
        self.current_user().user_id
    }

    fn is_logged_in(&self) -> bool {
        self.current_user().is_logged_in
    }
}

/// Process-local [`AuthSession`] backed by a mutex, used by tests and by
/// applications without an external session manager.
pub struct SharedAuth {
    state: Mutex<AuthUser>,
}

impl SharedAuth {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AuthUser::local_default()),
        }
    }

    pub fn with_user(user: AuthUser) -> Self {
        Self {
            state: Mutex::new(user),
        }
    }

    pub fn set_current(&self, user: AuthUser) {
        if let Ok(mut state) = self.state.lock() {
            *state = user;
        }
    }

    pub fn sign_in(&self, user: AuthUser) {
        self.set_current(user);
    }

    pub fn sign_out(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = AuthUser::local_default();
        }
    }
}

impl Default for SharedAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSession for SharedAuth {
    fn current_user(&self) -> AuthUser {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_else(|_| AuthUser::local_default())
    }
}
