//! Authentication collaborator.
//!
//! Only the gate matters to the workflow: routes other than Home require an
//! authenticated user. `StubAuthStore` stands in until a real identity
//! provider is wired up.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("login failed: {0}")]
    LoginFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Investigator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub name: String,
}

/// Answers whether the current session may enter gated routes.
pub trait AuthGate {
    fn is_authenticated(&self) -> bool;
}

/// In-memory auth store. Every login succeeds for a non-empty email.
#[derive(Debug, Default)]
pub struct StubAuthStore {
    user: Option<User>,
    loading: bool,
    error: Option<String>,
}

impl StubAuthStore {
    /// Auto-authenticate the demo investigator.
    pub fn initialize(&mut self) {
        self.begin();
        self.user = Some(User {
            id: "1".to_string(),
            email: "demo@example.com".to_string(),
            role: Role::Investigator,
            name: "Demo User".to_string(),
        });
        self.loading = false;
        tracing::debug!("auth initialized with demo user");
    }

    pub fn login(&mut self, email: &str, _password: &str) -> Result<&User, AuthError> {
        self.begin();
        let email = email.trim();
        if email.is_empty() {
            self.loading = false;
            self.error = Some("Login failed".to_string());
            return Err(AuthError::LoginFailed("email is empty".to_string()));
        }
        self.loading = false;
        tracing::info!(email, "logged in");
        Ok(&*self.user.insert(User {
            id: "1".to_string(),
            email: email.to_string(),
            role: Role::Investigator,
            name: "John Doe".to_string(),
        }))
    }

    pub fn logout(&mut self) {
        self.begin();
        self.user = None;
        self.loading = false;
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn begin(&mut self) {
        self.loading = true;
        self.error = None;
    }
}

impl AuthGate for StubAuthStore {
    fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}
