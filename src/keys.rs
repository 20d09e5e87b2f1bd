//! Persistent secret key material
//!
//! The key store is created once with random keys and reloaded on every
//! start afterwards, so issued sessions survive restarts.
//!
//! File layout (no versioning):
//! - 32 bytes session authentication key
//! - 32 bytes session encryption key
//! - URL-safe base64 encoding of 32 random bytes (CSRF secret)

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{Result, SesameError};

/// Size of the binary keys in bytes
pub const KEY_LEN: usize = 32;

/// Base64 of 32 bytes is 44 characters, the reader accepts up to 64
const MAX_CSRF_LEN: usize = 64;

/// Secret keys shared by the session machinery
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Keys {
    pub session_auth_key: [u8; KEY_LEN],
    pub session_encryption_key: [u8; KEY_LEN],
    pub csrf_key: String,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys").finish_non_exhaustive()
    }
}

impl Keys {
    /// Load the key store, creating it with fresh keys if it does not exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(key_store = %path.display(), "Key store doesn't exist. Create new keys.");
            return Self::create(path);
        }
        Self::read(path)
    }

    /// Generate new keys and write them to a new file
    ///
    /// Fails if the file already exists.
    pub fn create(path: &Path) -> Result<Self> {
        let keys = Self::generate();

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(|e| {
            SesameError::Keys(format!(
                "Can't open {} (for exclusive write): {e}",
                path.display()
            ))
        })?;
        file.write_all(&keys.session_auth_key)?;
        file.write_all(&keys.session_encryption_key)?;
        file.write_all(keys.csrf_key.as_bytes())?;
        file.sync_all()?;

        Ok(keys)
    }

    /// Read existing keys
    pub fn read(path: &Path) -> Result<Self> {
        let mut data = std::fs::read(path).map_err(|e| {
            SesameError::Keys(format!("Can't open {} (for read): {e}", path.display()))
        })?;

        let keys = Self::decode(&data);
        data.zeroize();
        keys
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 2 * KEY_LEN {
            return Err(SesameError::Keys(format!(
                "Key store too short: {} bytes",
                data.len()
            )));
        }

        let mut session_auth_key = [0u8; KEY_LEN];
        session_auth_key.copy_from_slice(&data[..KEY_LEN]);
        let mut session_encryption_key = [0u8; KEY_LEN];
        session_encryption_key.copy_from_slice(&data[KEY_LEN..2 * KEY_LEN]);

        let rest = &data[2 * KEY_LEN..];
        let rest = &rest[..rest.len().min(MAX_CSRF_LEN)];
        let csrf_key = String::from_utf8(rest.to_vec())
            .map_err(|_| SesameError::Keys("CSRF key is not valid UTF-8".into()))?;

        Ok(Self {
            session_auth_key,
            session_encryption_key,
            csrf_key,
        })
    }

    /// Fresh random keys, not persisted
    pub fn generate() -> Self {
        let mut session_auth_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut session_auth_key);
        let mut session_encryption_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut session_encryption_key);

        Self {
            session_auth_key,
            session_encryption_key,
            csrf_key: random_string(KEY_LEN),
        }
    }
}

/// URL-safe base64 encoding of `len` random bytes
fn random_string(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    let encoded = URL_SAFE.encode(&bytes);
    bytes.zeroize();
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");

        let created = Keys::create(&path).unwrap();
        let loaded = Keys::read(&path).unwrap();
        let loaded_again = Keys::load_or_create(&path).unwrap();

        assert_eq!(created, loaded);
        assert_eq!(loaded, loaded_again);
        assert_eq!(created.csrf_key.len(), 44);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");

        Keys::create(&path).unwrap();
        assert!(matches!(Keys::create(&path), Err(SesameError::Keys(_))));
    }

    #[test]
    fn test_truncated_store_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        std::fs::write(&path, [7u8; 40]).unwrap();

        assert!(matches!(Keys::read(&path), Err(SesameError::Keys(_))));
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = Keys::generate();
        let b = Keys::generate();
        assert_ne!(a.session_auth_key, b.session_auth_key);
        assert_ne!(a.session_auth_key, a.session_encryption_key);
    }

    #[cfg(unix)]
    #[test]
    fn test_store_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        Keys::create(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
