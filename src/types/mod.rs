//! Shared types for Sesame

mod error;

pub use error::{Result, SesameError};
