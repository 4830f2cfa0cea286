//! Orchestration for an AI game maker: streams generated game code, extracts
//! a runnable document, versions it, and runs the sketch-to-image and voice
//! side sessions.

pub mod config;
pub mod errors;
pub mod extraction;
pub mod iteration;
pub mod models;
pub mod prompt;
pub mod provider;
pub mod routes;
pub mod service;
pub mod session;

pub use routes::router;
