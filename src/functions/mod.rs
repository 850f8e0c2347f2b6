//! Functions the model may call mid-conversation.
//!
//! Each function is a [`ChatFunction`] with its own typed argument struct;
//! arguments are decoded into that struct when the function is invoked, so
//! malformed arguments are rejected by the function's own contract. The
//! [`FunctionRegistry`] exposes the declarations to the completion API and
//! dispatches calls by name.

pub mod hacker_news;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::ChatError;
use crate::llm::{ChatMessage, FunctionCall};

/// What a function handed back.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionOutput {
    /// Data for the model to continue from.
    Data(serde_json::Value),
    /// Text to show the caller directly, without another model turn.
    Reply(String),
    /// Nothing further to say.
    Nothing,
}

/// A function the model may call.
#[async_trait]
pub trait ChatFunction: Send + Sync + std::fmt::Debug {
    /// Typed arguments, decoded from the model's JSON.
    type Args: DeserializeOwned + Send;

    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of [`Self::Args`], as declared to the model.
    fn parameters(&self) -> serde_json::Value;
    async fn call(&self, args: Self::Args) -> anyhow::Result<FunctionOutput>;
}

/// Object-safe view of a [`ChatFunction`].
#[async_trait]
trait DynFunction: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters(&self) -> serde_json::Value;
    async fn invoke(&self, arguments: serde_json::Value) -> Result<FunctionOutput, ChatError>;
}

#[async_trait]
impl<F: ChatFunction> DynFunction for F {
    fn name(&self) -> &'static str {
        ChatFunction::name(self)
    }

    fn description(&self) -> &'static str {
        ChatFunction::description(self)
    }

    fn parameters(&self) -> serde_json::Value {
        ChatFunction::parameters(self)
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<FunctionOutput, ChatError> {
        let name = ChatFunction::name(self);
        let args: F::Args =
            serde_json::from_value(arguments).map_err(|source| ChatError::InvalidArguments {
                name: name.to_string(),
                source,
            })?;
        self.call(args).await.map_err(|source| ChatError::Function {
            name: name.to_string(),
            source,
        })
    }
}

/// Result of one function call, consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResult {
    /// Serialized function output (empty when there was none).
    pub content: String,
    /// Messages that continue the conversation, in order.
    pub follow_up: Vec<ChatMessage>,
}

/// What the orchestrator does next with a [`FunctionResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    /// No follow-ups: the response ends here.
    Complete,
    /// Follow-ups are renderable text: type them out directly.
    Typed(Vec<String>),
    /// Append the follow-ups and let the model continue.
    ResumeModel(Vec<ChatMessage>),
}

impl FunctionResult {
    fn from_output(call: &FunctionCall, output: FunctionOutput) -> Self {
        match output {
            FunctionOutput::Data(value) => {
                let content = value.to_string();
                Self {
                    follow_up: vec![
                        ChatMessage::assistant_function_call(call.clone()),
                        ChatMessage::function(call.name.clone(), content.clone()),
                    ],
                    content,
                }
            }
            FunctionOutput::Reply(text) => Self {
                follow_up: vec![ChatMessage::assistant(text.clone())],
                content: text,
            },
            FunctionOutput::Nothing => Self {
                content: String::new(),
                follow_up: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn continuation(self) -> Continuation {
        if self.follow_up.is_empty() {
            Continuation::Complete
        } else if self.follow_up.iter().all(ChatMessage::is_renderable) {
            Continuation::Typed(self.follow_up.into_iter().map(|m| m.content).collect())
        } else {
            Continuation::ResumeModel(self.follow_up)
        }
    }
}

/// Name → function mapping, in declaration order.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<Vec<Arc<dyn DynFunction>>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

impl FunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function. A later function with the same name replaces the earlier one.
    #[must_use]
    pub fn with_function<F: ChatFunction + 'static>(self, function: F) -> Self {
        let mut functions: Vec<Arc<dyn DynFunction>> = (*self.functions).clone();
        functions.retain(|f| f.name() != ChatFunction::name(&function));
        functions.push(Arc::new(function));
        Self {
            functions: Arc::new(functions),
        }
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.functions.iter().map(|f| f.name()).collect()
    }

    /// Declarations in the completion API's `functions` format.
    #[must_use]
    pub fn declarations(&self) -> Vec<serde_json::Value> {
        self.functions
            .iter()
            .map(|f| {
                serde_json::json!({
                    "name": f.name(),
                    "description": f.description(),
                    "parameters": f.parameters(),
                })
            })
            .collect()
    }

    /// Run the function the model asked for.
    ///
    /// # Errors
    ///
    /// [`ChatError::UnknownFunction`] for an undeclared name,
    /// [`ChatError::InvalidArguments`] when the arguments don't decode, and
    /// [`ChatError::Function`] when the handler fails.
    pub async fn invoke(&self, call: &FunctionCall) -> Result<FunctionResult, ChatError> {
        let function = self
            .functions
            .iter()
            .find(|f| f.name() == call.name)
            .ok_or_else(|| ChatError::UnknownFunction(call.name.clone()))?;

        let arguments = if call.arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&call.arguments).map_err(|source| {
                ChatError::InvalidArguments {
                    name: call.name.clone(),
                    source,
                }
            })?
        };

        tracing::info!(
            name: "function.invoked",
            function = %call.name,
            args_length = call.arguments.len(),
            "Invoking function"
        );
        let output = function.invoke(arguments).await?;
        Ok(FunctionResult::from_output(call, output))
    }
}
