//! Password hashes of local wiki accounts
//!
//! User files store `enc_password={PASSLIB}<hash>`, where `<hash>` is whatever
//! scheme passlib was configured with when the password was set. The scheme
//! is recognized from the hash prefix:
//!
//! | prefix | scheme | verified by |
//! |---|---|---|
//! | `$argon2i$`, `$argon2id$` | argon2 (PHC string) | argon2 |
//! | `$6$` | sha512_crypt | pwhash |
//! | `$5$` | sha256_crypt | pwhash |
//! | `$2a$`, `$2b$`, `$2y$` | bcrypt | pwhash |
//! | `$1$` | md5_crypt | pwhash |
//!
//! New hashes are always argon2id.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use crate::types::SesameError;

/// Prefix of the password line in a wiki user file
pub const PASSLIB_PREFIX: &str = "enc_password={PASSLIB}";

/// Hash scheme of a stored password
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashScheme {
    Argon2,
    Sha512Crypt,
    Sha256Crypt,
    Bcrypt,
    Md5Crypt,
}

impl HashScheme {
    pub fn detect(hash: &str) -> Option<Self> {
        const PREFIXES: [(&str, HashScheme); 8] = [
            ("$argon2id$", HashScheme::Argon2),
            ("$argon2i$", HashScheme::Argon2),
            ("$6$", HashScheme::Sha512Crypt),
            ("$5$", HashScheme::Sha256Crypt),
            ("$2b$", HashScheme::Bcrypt),
            ("$2a$", HashScheme::Bcrypt),
            ("$2y$", HashScheme::Bcrypt),
            ("$1$", HashScheme::Md5Crypt),
        ];
        PREFIXES
            .into_iter()
            .find(|(prefix, _)| hash.starts_with(prefix))
            .map(|(_, scheme)| scheme)
    }
}

/// Hash a password as an argon2id PHC string
pub fn hash_password(password: &str) -> Result<String, SesameError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| SesameError::Auth(format!("Failed to hash password: {e}")))
}

/// Check `password` against a stored hash of any supported scheme
///
/// `Ok(false)` is a wrong password, `Err` a hash that cannot be checked.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, SesameError> {
    let scheme = HashScheme::detect(hash)
        .ok_or_else(|| SesameError::Auth("Unsupported password hash scheme".into()))?;

    match scheme {
        HashScheme::Argon2 => {
            let parsed = PasswordHash::new(hash)
                .map_err(|e| SesameError::Auth(format!("Invalid argon2 hash: {e}")))?;
            Ok(Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok())
        }
        HashScheme::Sha512Crypt
        | HashScheme::Sha256Crypt
        | HashScheme::Bcrypt
        | HashScheme::Md5Crypt => Ok(pwhash::unix::verify(password, hash)),
    }
}

/// A complete password line for a wiki user file
pub fn passlib_line(password: &str) -> Result<String, SesameError> {
    Ok(format!("{PASSLIB_PREFIX}{}", hash_password(password)?))
}
