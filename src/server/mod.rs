//! HTTP server for usher

pub mod http;

pub use http::{run, AppState};
