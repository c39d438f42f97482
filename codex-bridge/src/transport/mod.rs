//! Transport layer for the bridge.
//!
//! Currently HTTP via axum.

pub mod http;

pub use http::{ServerConfig, serve};
