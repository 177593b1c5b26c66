//! Authentication seam.
//!
//! The engine consumes a verified identity and auth level; scheme
//! implementations live behind [`Authenticator`]. The built-in `basic`
//! validator backs tests and the default server; anything heavier
//! (tokens, OAuth) plugs in at the same seam.

use crate::error::EngineError;
use crate::types::Uid;
use async_trait::async_trait;
use dashmap::DashMap;

/// Trust level of an authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AuthLevel {
    #[default]
    Anon,
    Auth,
    Root,
}

/// A verified identity.
#[derive(Debug, Clone, Copy)]
pub struct AuthCtx {
    pub uid: Uid,
    pub level: AuthLevel,
}

/// Credential validation for one or more schemes.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Register credentials for an account.
    async fn add_record(&self, uid: Uid, scheme: &str, secret: &str) -> Result<(), EngineError>;

    /// Validate a secret and produce the identity it proves.
    async fn authenticate(&self, scheme: &str, secret: &str) -> Result<AuthCtx, EngineError>;
}

/// `basic` scheme: secret is `login:password`.
#[derive(Debug, Default)]
pub struct BasicAuthenticator {
    records: DashMap<String, (String, Uid)>,
}

impl BasicAuthenticator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn split_secret(secret: &str) -> Result<(&str, &str), EngineError> {
    let (login, password) = secret.split_once(':').ok_or(EngineError::Malformed)?;
    if login.is_empty() || password.is_empty() {
        return Err(EngineError::Malformed);
    }
    Ok((login, password))
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn add_record(&self, uid: Uid, scheme: &str, secret: &str) -> Result<(), EngineError> {
        if scheme != "basic" {
            return Err(EngineError::Invalid);
        }
        let (login, password) = split_secret(secret)?;
        match self.records.entry(login.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::Conflict),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert((password.to_string(), uid));
                Ok(())
            }
        }
    }

    async fn authenticate(&self, scheme: &str, secret: &str) -> Result<AuthCtx, EngineError> {
        if scheme != "basic" {
            return Err(EngineError::Invalid);
        }
        let (login, password) = split_secret(secret)?;
        let record = self.records.get(login).ok_or(EngineError::AuthRequired)?;
        if record.0 != password {
            return Err(EngineError::AuthRequired);
        }
        Ok(AuthCtx {
            uid: record.1,
            level: AuthLevel::Auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_auth_roundtrip() {
        let auth = BasicAuthenticator::new();
        let uid = Uid::from_raw(7);

        auth.add_record(uid, "basic", "alice:secret").await.unwrap();

        let ctx = auth.authenticate("basic", "alice:secret").await.unwrap();
        assert_eq!(ctx.uid, uid);
        assert_eq!(ctx.level, AuthLevel::Auth);

        assert_eq!(
            auth.authenticate("basic", "alice:wrong").await.unwrap_err(),
            EngineError::AuthRequired
        );
        assert_eq!(
            auth.authenticate("basic", "bob:secret").await.unwrap_err(),
            EngineError::AuthRequired
        );
    }

    #[tokio::test]
    async fn test_basic_auth_duplicate_login() {
        let auth = BasicAuthenticator::new();
        auth.add_record(Uid::from_raw(1), "basic", "alice:a")
            .await
            .unwrap();
        assert_eq!(
            auth.add_record(Uid::from_raw(2), "basic", "alice:b")
                .await
                .unwrap_err(),
            EngineError::Conflict
        );
    }

    #[tokio::test]
    async fn test_unknown_scheme_rejected() {
        let auth = BasicAuthenticator::new();
        assert_eq!(
            auth.authenticate("token", "xyz").await.unwrap_err(),
            EngineError::Invalid
        );
        assert_eq!(
            auth.authenticate("basic", "no-colon").await.unwrap_err(),
            EngineError::Malformed
        );
    }
}
