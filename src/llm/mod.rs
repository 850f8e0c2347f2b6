//! Completion API client and chat orchestration.
//!
//! The [`LlmDriver`] trait is the seam to the upstream completion API: it
//! turns a conversation plus function declarations into a stream of
//! [`NormalizedEvent`]s. The [`Orchestrator`] drives a driver, intercepts
//! function calls, runs them through the [`FunctionRegistry`] and turns the
//! whole exchange into the plain-text body sent to the caller.
//!
//! [`FunctionRegistry`]: crate::functions::FunctionRegistry
//!
//! # Example
//!
//! ```rust,ignore
//! use chathn::llm::{ChatCompletionsDriver, LlmSettings, Orchestrator};
//!
//! let settings = LlmSettings {
//!     base_url: "https://api.openai.com".to_string(),
//!     api_key: Some("sk-...".to_string()),
//!     model: "gpt-4-0125-preview".to_string(),
//! };
//! let driver = Arc::new(ChatCompletionsDriver::new(settings));
//! let orchestrator = Orchestrator::new(driver, functions, chat_config);
//! let body = orchestrator.respond(messages).await?;
//! ```

pub mod chat_completions;
pub mod orchestrator;

pub use chat_completions::ChatCompletionsDriver;
pub use orchestrator::Orchestrator;

use crate::normalized::NormalizedEvent;
use futures::Stream;

/// Completion API connection and model settings.
#[derive(Clone)]
pub struct LlmSettings {
    /// Base URL for the API (e.g., `https://api.openai.com`).
    pub base_url: String,
    /// Optional API key, sent as a bearer token.
    pub api_key: Option<String>,
    /// Model identifier (e.g., `gpt-4-0125-preview`).
    pub model: String,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .finish()
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System preamble.
    System,
    /// End-user message.
    User,
    /// Model output.
    Assistant,
    /// Result of a function call.
    Function,
}

/// A message in a conversation. Order is significant.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content. Empty for assistant messages that only carry a function call.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    /// Function name, for [`MessageRole::Function`] messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Function call requested by the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

/// Upstream sends `"content": null` on function-call turns.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let content: Option<String> = serde::Deserialize::deserialize(deserializer)?;
    Ok(content.unwrap_or_default())
}

impl ChatMessage {
    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            function_call: None,
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    /// Assistant turn that requested `call`.
    #[must_use]
    pub fn assistant_function_call(call: FunctionCall) -> Self {
        Self {
            function_call: Some(call),
            ..Self::plain(MessageRole::Assistant, "")
        }
    }

    /// Result of function `name`, fed back to the model.
    #[must_use]
    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::plain(MessageRole::Function, content)
        }
    }

    /// True for assistant text the caller can be shown as-is.
    #[must_use]
    pub fn is_renderable(&self) -> bool {
        self.role == MessageRole::Assistant
            && self.function_call.is_none()
            && !self.content.is_empty()
    }
}

/// A function call emitted by the model.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FunctionCall {
    /// Function name.
    pub name: String,
    /// Arguments as a JSON-encoded string, exactly as the model produced them.
    #[serde(default)]
    pub arguments: String,
}

/// Request to an LLM driver.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Conversation, system preamble first.
    pub messages: Vec<ChatMessage>,
    /// Function declarations in the completion API's `functions` format.
    pub functions: Vec<serde_json::Value>,
}

/// Boxed stream of driver events.
pub type EventStream =
    std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<NormalizedEvent>> + Send>>;

/// Trait for streaming completion drivers.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync {
    /// Open a streaming completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or is rejected.
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream>;
}
