//! Member authentication
//!
//! Two interchangeable authenticators check member credentials:
//! - [`OnlineAuth`] asks the wiki's auth service, with an email cache
//! - [`LocalFilesAuth`] reads the wiki's user files from disk
//!
//! Both accept either a user name or an email address (anything containing
//! '@') as identifier.

pub mod directory;
pub mod identity_cache;
pub mod local;
pub mod online;
pub mod password;
pub mod session;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::AuthConfig;
use crate::types::Result;

pub use directory::{Directory, DirectoryError, DirectoryUser, LoginCheck, WikiDirectory};
pub use identity_cache::IdentityCache;
pub use local::LocalFilesAuth;
pub use online::OnlineAuth;
pub use password::{hash_password, verify_password};
pub use session::{bearer_token, Claims, SessionSigner};

/// Outcome of a credential check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Carries the canonical user name
    Success(String),
    NotFound,
    InvalidCredentials,
    /// The check itself failed, nothing is known about the credentials
    SystemError(String),
}

impl AuthResult {
    pub fn is_system_error(&self) -> bool {
        matches!(self, Self::SystemError(_))
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn check_password(&self, identifier: &str, password: &str) -> AuthResult;
}

/// Build the configured authenticator
pub fn build_authenticator(config: &AuthConfig) -> Result<Arc<dyn Authenticator>> {
    let authenticator: Arc<dyn Authenticator> = match config {
        AuthConfig::Online(online) => Arc::new(OnlineAuth::new(online)?),
        AuthConfig::Local(local) => Arc::new(LocalFilesAuth::load(local)?),
    };
    Ok(authenticator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_error_flag() {
        assert!(AuthResult::SystemError("down".into()).is_system_error());
        assert!(!AuthResult::InvalidCredentials.is_system_error());
    }
}
