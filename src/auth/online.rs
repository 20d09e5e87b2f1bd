//! Authentication against the wiki's auth service
//!
//! Emails are resolved to user names through the [`IdentityCache`], the
//! password itself is always verified remotely.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::directory::{Directory, DirectoryError, LoginCheck, WikiDirectory};
use super::identity_cache::IdentityCache;
use super::{AuthResult, Authenticator};
use crate::config::OnlineAuthConfig;
use crate::types::{Result, SesameError};

pub struct OnlineAuth {
    directory: Arc<dyn Directory>,
    identities: IdentityCache,
}

impl OnlineAuth {
    pub fn new(config: &OnlineAuthConfig) -> Result<Self> {
        let directory = WikiDirectory::new(config)
            .map_err(|e| SesameError::Config(format!("Could not create directory client: {e}")))?;
        Ok(Self::with_directory(
            Arc::new(directory),
            Duration::from_secs(config.cache_max_age_secs),
        ))
    }

    pub fn with_directory(directory: Arc<dyn Directory>, cache_max_age: Duration) -> Self {
        Self {
            identities: IdentityCache::new(Arc::clone(&directory), cache_max_age),
            directory,
        }
    }

    async fn try_check_password(
        &self,
        identifier: &str,
        password: &str,
    ) -> std::result::Result<AuthResult, DirectoryError> {
        let user_name = if identifier.contains('@') {
            match self.identities.get(identifier).await? {
                Some(name) => name,
                None => {
                    info!(login = %identifier, "email doesn't exist");
                    return Ok(AuthResult::NotFound);
                }
            }
        } else {
            identifier.to_string()
        };

        let result = match self.directory.login_check(&user_name, password).await? {
            LoginCheck::Ok => AuthResult::Success(user_name),
            LoginCheck::UnknownUser => {
                info!(user = %user_name, "name doesn't exist (or not in Member group)");
                AuthResult::NotFound
            }
            LoginCheck::WrongPassword => {
                info!(user = %user_name, "Invalid password");
                AuthResult::InvalidCredentials
            }
            LoginCheck::Other(result) => {
                error!(user = %user_name, result = %result, "Unexpected login check result");
                AuthResult::SystemError(format!("Unexpected result: {result}"))
            }
        };
        Ok(result)
    }
}

#[async_trait]
impl Authenticator for OnlineAuth {
    async fn check_password(&self, identifier: &str, password: &str) -> AuthResult {
        match self.try_check_password(identifier, password).await {
            Ok(result) => result,
            Err(e) => {
                error!(login = %identifier, error = %e, "Remote authentication failed");
                AuthResult::SystemError(e.to_string())
            }
        }
    }
}
