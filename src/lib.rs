//! ChatHN: a chat endpoint for browsing Hacker News with an LLM.
//!
//! `POST /api/chat` takes a conversation, forwards it to an OpenAI-compatible
//! completion API together with a set of Hacker News functions, and streams
//! the answer back as plain text. Requests are rate limited per client.
//!
//! # Modules
//!
//! - [`rate_limit`]: sliding-window limiter and its middleware
//! - [`llm`]: completion driver and the chat orchestrator
//! - [`functions`]: functions the model may call
//! - [`typing`]: character-by-character streaming of function replies
//! - [`server`]: router and server start-up

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod error;
pub mod functions;
pub mod llm;
pub mod normalized;
pub mod rate_limit;
pub mod server;
pub mod telemetry;
pub mod typing;

use llm::orchestrator::Orchestrator;
use rate_limit::RateLimiter;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Chat pipeline.
    pub orchestrator: Arc<Orchestrator>,
    /// Per-client request limiter.
    pub rate_limiter: Arc<RateLimiter>,
}
