//! Sesame - door buzzer gateway for a hackerspace
//!
//! "Open sesame" - members who are logged in can buzz the doors while the
//! space status says it is open.
//!
//! ## Components
//!
//! - **Bus**: status subscription and buzz commands over MQTT or NATS
//! - **Auth**: member credentials checked against the wiki, online or from local files
//! - **Keys**: persistent session key material
//! - **Server**: small JSON HTTP gateway tying it together

pub mod auth;
pub mod bus;
pub mod config;
pub mod keys;
pub mod server;
pub mod types;

pub use config::{Args, Config};
pub use server::{run, AppState};
pub use types::{Result, SesameError};
