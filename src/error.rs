//! Error types for the chat pipeline.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failure of a chat request.
///
/// Rate-limit exhaustion is not represented here: it is a normal decision
/// answered with `429`, see [`crate::rate_limit`].
#[derive(Error, Debug)]
pub enum ChatError {
    /// The rate-limit store could not be reached or answered garbage.
    #[error("rate limit store error: {0}")]
    RateLimitStore(#[source] anyhow::Error),

    /// The completion API failed to open or broke mid-stream.
    #[error("upstream error: {0}")]
    Upstream(#[source] anyhow::Error),

    /// The model asked for a function that is not registered.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// The model supplied arguments that do not fit the function's contract.
    #[error("invalid arguments for function '{name}': {source}")]
    InvalidArguments {
        /// Function name.
        name: String,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },

    /// A function handler failed.
    #[error("function '{name}' failed: {source}")]
    Function {
        /// Function name.
        name: String,
        /// Handler error.
        #[source]
        source: anyhow::Error,
    },

    /// The model kept calling functions past the per-request bound.
    #[error("too many function rounds ({0})")]
    TooManyFunctionRounds(usize),
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        tracing::error!(name: "chat.request.failed", error = %self, "Chat request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_variant_is_a_server_error() {
        let errors = vec![
            ChatError::RateLimitStore(anyhow::anyhow!("connection refused")),
            ChatError::Upstream(anyhow::anyhow!("502")),
            ChatError::UnknownFunction("launch_rockets".to_string()),
            ChatError::TooManyFunctionRounds(5),
        ];

        for err in errors {
            let response = err.into_response();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[test]
    fn test_unknown_function_message_names_the_function() {
        let err = ChatError::UnknownFunction("launch_rockets".to_string());
        assert_eq!(err.to_string(), "unknown function: launch_rockets");
    }
}
