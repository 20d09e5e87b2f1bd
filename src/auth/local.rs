//! Authentication from local wiki files
//!
//! Reads a MoinMoin data directory once at startup:
//! - the member group page, one `* name` bullet per member
//! - the user directory, one key=value file per account
//!
//! Only members listed on the group page can log in.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

use super::password::{verify_password, PASSLIB_PREFIX};
use super::{AuthResult, Authenticator};
use crate::config::LocalAuthConfig;
use crate::types::{Result, SesameError};

const EMAIL_PREFIX: &str = "email=";
const NAME_PREFIX: &str = "name=";

#[derive(Debug, PartialEq, Eq)]
struct UserEntry {
    name: String,
    email: String,
    hash: String,
}

pub struct LocalFilesAuth {
    /// member name -> password hash
    name_to_hash: HashMap<String, String>,
    /// lowercased email -> member name
    email_to_name: HashMap<String, String>,
}

impl LocalFilesAuth {
    pub fn load(config: &LocalAuthConfig) -> Result<Self> {
        let members = load_group_page(&config.group_page_file)?;
        let mut auth = Self {
            name_to_hash: HashMap::new(),
            email_to_name: HashMap::new(),
        };

        let entries = std::fs::read_dir(&config.user_directory).map_err(|e| {
            SesameError::Config(format!(
                "Can't read user directory {}: {e}",
                config.user_directory.display()
            ))
        })?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(|e| {
                SesameError::Config(format!("Can't open user file {}: {e}", path.display()))
            })?;
            match parse_user_file(&String::from_utf8_lossy(&bytes)) {
                Some(user) if members.contains(&user.name) => auth.insert(user),
                Some(_) => {}
                None => debug!(file = %path.display(), "Missing email/pw/name entry"),
            }
        }

        info!(
            members = members.len(),
            users = auth.name_to_hash.len(),
            "Loaded local user data"
        );
        Ok(auth)
    }

    fn insert(&mut self, user: UserEntry) {
        self.email_to_name
            .insert(user.email.to_lowercase(), user.name.clone());
        self.name_to_hash.insert(user.name, user.hash);
    }
}

#[async_trait]
impl Authenticator for LocalFilesAuth {
    async fn check_password(&self, identifier: &str, password: &str) -> AuthResult {
        let user_name = if identifier.contains('@') {
            match self.email_to_name.get(&identifier.to_lowercase()) {
                Some(name) => name.clone(),
                None => return AuthResult::NotFound,
            }
        } else {
            identifier.to_string()
        };

        let Some(hash) = self.name_to_hash.get(&user_name).cloned() else {
            info!(login = %identifier, "User doesn't exist (or not in Member group).");
            return AuthResult::NotFound;
        };

        // hash verification blocks for a while, run it off the runtime
        let password = password.to_string();
        let verified =
            tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await;

        match verified {
            Ok(Ok(true)) => AuthResult::Success(user_name),
            Ok(Ok(false)) => {
                info!(login = %identifier, "Invalid password.");
                AuthResult::InvalidCredentials
            }
            Ok(Err(e)) => {
                // unsupported scheme or malformed hash
                warn!(login = %identifier, error = %e, "Could not verify password.");
                AuthResult::InvalidCredentials
            }
            Err(e) => AuthResult::SystemError(format!("Password verification failed: {e}")),
        }
    }
}

fn load_group_page(path: &Path) -> Result<HashSet<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SesameError::Config(format!("Can't open group file {}: {e}", path.display()))
    })?;
    Ok(content
        .lines()
        .filter_map(parse_group_line)
        .map(str::to_string)
        .collect())
}

/// Member name of a `* name` bullet line
fn parse_group_line(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('*')?.trim_start();
    (!rest.is_empty()).then_some(rest)
}

fn parse_user_file(content: &str) -> Option<UserEntry> {
    let mut email = "";
    let mut hash = "";
    let mut name = "";
    for line in content.lines() {
        if let Some(value) = line.strip_prefix(EMAIL_PREFIX) {
            email = value;
        } else if let Some(value) = line.strip_prefix(PASSLIB_PREFIX) {
            hash = value;
        } else if let Some(value) = line.strip_prefix(NAME_PREFIX) {
            name = value;
        }
    }

    if email.is_empty() || hash.is_empty() || name.is_empty() {
        return None;
    }
    Some(UserEntry {
        name: name.to_string(),
        email: email.to_string(),
        hash: hash.to_string(),
    })
}
