//! Normalized event types for streaming completions.
//!
//! Drivers translate the upstream wire protocol into these events; the
//! orchestrator only ever sees [`NormalizedEvent`]s.
//!
//! # Example
//!
//! ```rust
//! use chathn::normalized::NormalizedEvent;
//!
//! let event = NormalizedEvent::MessageDelta {
//!     text: "Hello".to_string(),
//! };
//! assert_eq!(event.name(), "message.delta");
//! ```

/// Normalized streaming events emitted by an LLM driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    /// Incremental text from the assistant.
    MessageDelta {
        /// The text fragment to append.
        text: String,
    },

    /// Incremental function call (streaming assembly).
    FunctionCallDelta {
        /// Function name (usually only in the first delta).
        name: Option<String>,
        /// Incremental arguments JSON fragment.
        arguments_delta: Option<String>,
    },

    /// The model finished with a function call, fully assembled.
    FunctionCallComplete {
        /// Function name.
        name: String,
        /// Complete arguments as a JSON string.
        arguments_json: String,
    },

    /// Stream has completed.
    Done,
}

impl NormalizedEvent {
    /// Event name, as used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageDelta { .. } => "message.delta",
            Self::FunctionCallDelta { .. } => "function_call.delta",
            Self::FunctionCallComplete { .. } => "function_call.complete",
            Self::Done => "done",
        }
    }
}
