//! Credential storage collaborator.
//!
//! The runtime reads the access token before every authenticated attempt and writes the
//! new pair after a successful refresh. Hosts back this with whatever persistent storage
//! they have; [`InMemoryCredentialStore`] covers tests and short-lived processes.

use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::Arc;

/// Access/refresh token pair.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self { access_token: access_token.into(), refresh_token }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Persistent key/value store for the session's tokens.
pub trait CredentialStore: Send + Sync + fmt::Debug {
    fn access_token(&self) -> Option<String>;
    fn refresh_token(&self) -> Option<String>;
    fn set_tokens(&self, access_token: String, refresh_token: Option<String>);
    fn clear(&self);
}

/// Lock-free in-memory store; readers get a consistent snapshot of the pair.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    tokens: ArcSwapOption<TokenPair>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(pair: TokenPair) -> Self {
        Self { tokens: ArcSwapOption::from_pointee(pair) }
    }

    /// Current pair, if any.
    pub fn snapshot(&self) -> Option<Arc<TokenPair>> {
        self.tokens.load_full()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn access_token(&self) -> Option<String> {
        self.tokens.load_full().map(|pair| pair.access_token.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        self.tokens.load_full().and_then(|pair| pair.refresh_token.clone())
    }

    fn set_tokens(&self, access_token: String, refresh_token: Option<String>) {
        self.tokens.store(Some(Arc::new(TokenPair { access_token, refresh_token })));
    }

    fn clear(&self) {
        self.tokens.store(None);
    }
}
