//! HTTP gateway for members

pub mod http;

pub use http::{run, serve, AppState};
