//! Shared application state handed to the HTTP layer.

use crate::lifecycle::LifecycleManager;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// How requests are authorized.
#[derive(Clone)]
pub enum Auth {
    /// Development mode: every request is let through.
    Insecure,
    /// Requests must carry `Authorization: Bearer <token>`.
    Bearer(Arc<str>),
}

impl Auth {
    pub fn bearer(token: impl Into<String>) -> Self {
        Auth::Bearer(Arc::from(token.into()))
    }

    /// Check a raw `Authorization` header value.
    pub fn permits(&self, header: Option<&str>) -> bool {
        match self {
            Auth::Insecure => true,
            Auth::Bearer(expected) => header
                .and_then(|h| h.strip_prefix("Bearer "))
                .is_some_and(|presented| token_matches(expected, presented)),
        }
    }
}

// Length leaks, contents do not.
fn token_matches(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LifecycleManager>,
    pub auth: Auth,
}

impl AppState {
    pub fn new(manager: Arc<LifecycleManager>, auth: Auth) -> Self {
        Self { manager, auth }
    }
}
