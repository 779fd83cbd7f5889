//! Access credentials for the realtime handshake and GraphQL requests.
//!
//! Acquiring a token (login, refresh) happens elsewhere; this module only
//! defines how the client asks for the current one.

use std::sync::{Arc, RwLock};

/// Supplies the current access token, if the user has one.
pub trait CredentialSource: Send + Sync + 'static {
    fn access_token(&self) -> Option<String>;
}

/// A token fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl CredentialSource for StaticToken {
    fn access_token(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.clone())
        }
    }
}

/// A token that the host application replaces after login or refresh.
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    token: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }
}

impl CredentialSource for SharedToken {
    fn access_token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl<F> CredentialSource for F
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn access_token(&self) -> Option<String> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_static_token_is_absent() {
        assert_eq!(StaticToken::new("").access_token(), None);
        assert_eq!(StaticToken::new("t").access_token().as_deref(), Some("t"));
    }

    #[test]
    fn shared_token_follows_updates() {
        let token = SharedToken::new();
        let reader = token.clone();
        assert_eq!(reader.access_token(), None);
        token.set(Some("fresh".into()));
        assert_eq!(reader.access_token().as_deref(), Some("fresh"));
    }

    #[test]
    fn closures_are_credential_sources() {
        let source = || Some("from-closure".to_string());
        assert_eq!(source.access_token().as_deref(), Some("from-closure"));
    }
}
