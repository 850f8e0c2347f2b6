//! Chat orchestration with function-call interception.
//!
//! The orchestrator manages one chat response:
//! 1. Prepend the system preamble and open a streaming completion
//! 2. Relay text deltas to the caller as they arrive
//! 3. If the model finishes with a function call, run it via the registry
//! 4. Depending on the result: stop, type the function's reply out
//!    character by character, or feed the result back to the model and
//!    continue relaying
//!
//! The returned body stream owns the whole pipeline. Dropping it (for
//! example when the client disconnects) drops the upstream connection, any
//! function call in flight and any pending typing delay.

use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ChatError;
use crate::functions::{Continuation, FunctionRegistry};
use crate::normalized::NormalizedEvent;
use crate::typing::{TypingConfig, typed_stream};

use super::{ChatMessage, EventStream, FunctionCall, LlmDriver, LlmRequest};

/// Body stream handed to the HTTP layer.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatError>> + Send>>;

/// Chat behaviour settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Preamble sent as the first (system) message of every conversation.
    pub system_prompt: String,
    /// Function calls allowed per request before giving up.
    pub max_function_rounds: usize,
    /// Pacing for function replies typed directly to the caller.
    pub typing: TypingConfig,
}

/// How a response pipeline ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamOutcome {
    /// Still running when dropped: the caller went away.
    Aborted,
    Closed,
    Failed(String),
}

/// Logs how a response pipeline ended.
struct StreamGuard {
    request_id: String,
    outcome: StreamOutcome,
}

impl StreamGuard {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            outcome: StreamOutcome::Aborted,
        }
    }

    fn complete(&mut self) {
        self.outcome = StreamOutcome::Closed;
    }

    /// Record `err` as the reason the stream ends, and pass it on.
    fn fail(&mut self, err: ChatError) -> ChatError {
        self.outcome = StreamOutcome::Failed(err.to_string());
        err
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        match &self.outcome {
            StreamOutcome::Closed => tracing::debug!(
                name: "chat.stream.closed",
                request_id = %self.request_id,
                "Chat stream closed"
            ),
            StreamOutcome::Failed(error) => tracing::error!(
                name: "chat.stream.failed",
                request_id = %self.request_id,
                error = %error,
                "Chat stream failed"
            ),
            StreamOutcome::Aborted => tracing::info!(
                name: "chat.stream.aborted",
                request_id = %self.request_id,
                "Chat stream dropped before completion"
            ),
        }
    }
}

/// Chat orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    driver: Arc<dyn LlmDriver>,
    functions: FunctionRegistry,
    config: ChatConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("functions", &self.functions)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(driver: Arc<dyn LlmDriver>, functions: FunctionRegistry, config: ChatConfig) -> Self {
        Self {
            driver,
            functions,
            config,
        }
    }

    async fn open(&self, messages: &[ChatMessage]) -> Result<EventStream, ChatError> {
        self.driver
            .stream(LlmRequest {
                messages: messages.to_vec(),
                functions: self.functions.declarations(),
            })
            .await
            .map_err(ChatError::Upstream)
    }

    /// Answer `conversation` as a stream of UTF-8 text chunks.
    ///
    /// The completion is opened before this returns, so a refused upstream
    /// request fails the whole request. Later failures end the stream with
    /// an error item.
    pub async fn respond(&self, conversation: Vec<ChatMessage>) -> Result<ByteStream, ChatError> {
        let request_id = Uuid::new_v4().to_string();

        let mut messages = Vec::with_capacity(conversation.len() + 1);
        messages.push(ChatMessage::system(self.config.system_prompt.clone()));
        messages.extend(conversation);

        tracing::info!(
            request_id = %request_id,
            message_count = messages.len(),
            function_count = self.functions.names().len(),
            "Starting chat"
        );

        let first = self.open(&messages).await?;
        let orchestrator = self.clone();

        let out = async_stream::try_stream! {
            let mut guard = StreamGuard::new(request_id.clone());
            let mut upstream = first;
            let mut rounds = 0;

            loop {
                let mut pending: Option<FunctionCall> = None;

                while let Some(event) = upstream.next().await {
                    let event = event.map_err(|e| guard.fail(ChatError::Upstream(e)))?;
                    tracing::trace!(request_id = %request_id, event = event.name(), "Upstream event");
                    match event {
                        NormalizedEvent::MessageDelta { text } => {
                            yield Bytes::from(text);
                        }
                        NormalizedEvent::FunctionCallDelta { arguments_delta, .. } => {
                            tracing::trace!(
                                request_id = %request_id,
                                delta_len = arguments_delta.as_deref().map_or(0, str::len),
                                "Function call arguments streaming"
                            );
                        }
                        NormalizedEvent::FunctionCallComplete { name, arguments_json } => {
                            pending = Some(FunctionCall { name, arguments: arguments_json });
                        }
                        NormalizedEvent::Done => break,
                    }
                }

                let Some(call) = pending else {
                    break;
                };

                rounds += 1;
                if rounds > orchestrator.config.max_function_rounds {
                    tracing::error!(
                        request_id = %request_id,
                        rounds,
                        "Function round limit exceeded"
                    );
                    Err::<(), _>(guard.fail(ChatError::TooManyFunctionRounds(
                        orchestrator.config.max_function_rounds,
                    )))?;
                }

                tracing::info!(
                    request_id = %request_id,
                    round = rounds,
                    function = %call.name,
                    "Function call intercepted"
                );
                let result = orchestrator
                    .functions
                    .invoke(&call)
                    .await
                    .map_err(|e| guard.fail(e))?;

                match result.continuation() {
                    Continuation::Complete => {
                        tracing::warn!(
                            request_id = %request_id,
                            function = %call.name,
                            "Function returned no follow-up; closing with no further output"
                        );
                        break;
                    }
                    Continuation::Typed(chunks) => {
                        tracing::debug!(
                            request_id = %request_id,
                            chunk_count = chunks.len(),
                            "Typing function reply"
                        );
                        let typed = typed_stream(chunks, orchestrator.config.typing);
                        futures::pin_mut!(typed);
                        while let Some(bytes) = typed.next().await {
                            yield bytes;
                        }
                        break;
                    }
                    Continuation::ResumeModel(follow_up) => {
                        messages.extend(follow_up);
                        upstream = orchestrator
                            .open(&messages)
                            .await
                            .map_err(|e| guard.fail(e))?;
                    }
                }
            }

            guard.complete();
        };

        Ok(Box::pin(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{ChatFunction, FunctionOutput};
    use crate::llm::MessageRole;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays one scripted event list per `stream` call and records requests.
    #[derive(Default)]
    struct ScriptedDriver {
        scripts: Mutex<VecDeque<Vec<anyhow::Result<NormalizedEvent>>>>,
        requests: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedDriver {
        fn new(scripts: Vec<Vec<anyhow::Result<NormalizedEvent>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmDriver for ScriptedDriver {
        async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
            self.requests.lock().unwrap().push(req);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("upstream unavailable"))?;
            Ok(Box::pin(futures::stream::iter(script)))
        }
    }

    #[derive(Debug, Clone)]
    struct Lookup {
        calls: Arc<AtomicUsize>,
    }

    #[derive(Deserialize)]
    struct LookupArgs {
        mode: String,
    }

    #[async_trait]
    impl ChatFunction for Lookup {
        type Args = LookupArgs;

        fn name(&self) -> &'static str {
            "lookup"
        }

        fn description(&self) -> &'static str {
            "Test lookup"
        }

        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"mode": {"type": "string"}}})
        }

        async fn call(&self, args: LookupArgs) -> anyhow::Result<FunctionOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(match args.mode.as_str() {
                "reply" => FunctionOutput::Reply("Typed reply".to_string()),
                "nothing" => FunctionOutput::Nothing,
                _ => FunctionOutput::Data(json!({"answer": 42})),
            })
        }
    }

    fn config() -> ChatConfig {
        ChatConfig {
            system_prompt: "You are a test.".to_string(),
            max_function_rounds: 2,
            typing: TypingConfig {
                max_length: 200,
                min_delay_ms: 30,
                max_delay_ms: 100,
            },
        }
    }

    fn text(t: &str) -> anyhow::Result<NormalizedEvent> {
        Ok(NormalizedEvent::MessageDelta { text: t.to_string() })
    }

    fn function_call(mode: &str) -> anyhow::Result<NormalizedEvent> {
        Ok(NormalizedEvent::FunctionCallComplete {
            name: "lookup".to_string(),
            arguments_json: json!({ "mode": mode }).to_string(),
        })
    }

    fn done() -> anyhow::Result<NormalizedEvent> {
        Ok(NormalizedEvent::Done)
    }

    fn setup(scripts: Vec<Vec<anyhow::Result<NormalizedEvent>>>) -> (Orchestrator, Arc<ScriptedDriver>, Arc<AtomicUsize>) {
        let driver = ScriptedDriver::new(scripts);
        let calls = Arc::new(AtomicUsize::new(0));
        let functions = FunctionRegistry::new().with_function(Lookup { calls: calls.clone() });
        (Orchestrator::new(driver.clone(), functions, config()), driver, calls)
    }

    async fn collect(stream: ByteStream) -> (String, Option<ChatError>) {
        let mut body = Vec::new();
        let mut error = None;
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => body.extend_from_slice(&bytes),
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        (String::from_utf8(body).unwrap(), error)
    }

    #[test]
    fn test_stream_guard_outcomes() {
        let mut guard = StreamGuard::new("req".to_string());
        assert_eq!(guard.outcome, StreamOutcome::Aborted);

        let err = guard.fail(ChatError::UnknownFunction("launch".to_string()));
        assert!(matches!(err, ChatError::UnknownFunction(_)));
        assert_eq!(
            guard.outcome,
            StreamOutcome::Failed("unknown function: launch".to_string())
        );

        let mut guard = StreamGuard::new("req".to_string());
        guard.complete();
        assert_eq!(guard.outcome, StreamOutcome::Closed);
    }

    #[tokio::test]
    async fn test_relays_text_without_function_call() {
        let (orchestrator, driver, calls) = setup(vec![vec![text("Hello"), text(", world"), done()]]);

        let stream = orchestrator.respond(vec![ChatMessage::user("hi")]).await.unwrap();
        let (body, error) = collect(stream).await;

        assert_eq!(body, "Hello, world");
        assert!(error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let requests = driver.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages[0], ChatMessage::system("You are a test."));
        assert_eq!(requests[0].messages[1], ChatMessage::user("hi"));
        assert_eq!(requests[0].functions[0]["name"], "lookup");
    }

    #[tokio::test]
    async fn test_stream_without_done_still_completes() {
        let (orchestrator, _, _) = setup(vec![vec![text("partial")]]);
        let (body, error) = collect(orchestrator.respond(vec![ChatMessage::user("hi")]).await.unwrap()).await;
        assert_eq!(body, "partial");
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_function_data_resumes_model() {
        let (orchestrator, driver, calls) = setup(vec![
            vec![function_call("data"), done()],
            vec![text("The answer is 42."), done()],
        ]);

        let stream = orchestrator.respond(vec![ChatMessage::user("what?")]).await.unwrap();
        let (body, error) = collect(stream).await;

        assert_eq!(body, "The answer is 42.");
        assert!(error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let requests = driver.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let resumed = &requests[1].messages;
        assert_eq!(resumed.len(), 4);
        assert_eq!(resumed[2].role, MessageRole::Assistant);
        assert_eq!(resumed[2].function_call.as_ref().unwrap().name, "lookup");
        assert_eq!(resumed[3], ChatMessage::function("lookup", "{\"answer\":42}"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_function_reply_is_typed_without_model() {
        let (orchestrator, driver, calls) = setup(vec![vec![function_call("reply"), done()]]);

        let stream = orchestrator.respond(vec![ChatMessage::user("hi")]).await.unwrap();
        let (body, error) = collect(stream).await;

        assert_eq!(body, "Typed reply");
        assert!(error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(driver.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_function_without_follow_up_ends_empty() {
        let (orchestrator, driver, calls) = setup(vec![vec![function_call("nothing"), done()]]);

        let (body, error) = collect(orchestrator.respond(vec![ChatMessage::user("hi")]).await.unwrap()).await;

        assert_eq!(body, "");
        assert!(error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(driver.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_text_before_function_call_is_relayed() {
        let (orchestrator, _, _) = setup(vec![
            vec![text("Let me check. "), function_call("data"), done()],
            vec![text("42."), done()],
        ]);
        let (body, _) = collect(orchestrator.respond(vec![ChatMessage::user("hi")]).await.unwrap()).await;
        assert_eq!(body, "Let me check. 42.");
    }

    #[tokio::test]
    async fn test_unknown_function_fails_the_stream() {
        let (orchestrator, _, calls) = setup(vec![vec![
            text("One moment"),
            Ok(NormalizedEvent::FunctionCallComplete {
                name: "launch".to_string(),
                arguments_json: "{}".to_string(),
            }),
            done(),
        ]]);

        let (body, error) = collect(orchestrator.respond(vec![ChatMessage::user("hi")]).await.unwrap()).await;

        assert_eq!(body, "One moment");
        assert!(matches!(error, Some(ChatError::UnknownFunction(n)) if n == "launch"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_round_limit() {
        let (orchestrator, _, calls) = setup(vec![
            vec![function_call("data"), done()],
            vec![function_call("data"), done()],
            vec![function_call("data"), done()],
        ]);

        let (_, error) = collect(orchestrator.respond(vec![ChatMessage::user("hi")]).await.unwrap()).await;

        assert!(matches!(error, Some(ChatError::TooManyFunctionRounds(2))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_failure_is_reported_before_streaming() {
        let (orchestrator, _, _) = setup(Vec::new());
        let err = orchestrator.respond(vec![ChatMessage::user("hi")]).await.err().unwrap();
        assert!(matches!(err, ChatError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_upstream_error_mid_stream() {
        let (orchestrator, _, _) = setup(vec![vec![text("Hel"), Err(anyhow::anyhow!("connection reset"))]]);
        let (body, error) = collect(orchestrator.respond(vec![ChatMessage::user("hi")]).await.unwrap()).await;
        assert_eq!(body, "Hel");
        assert!(matches!(error, Some(ChatError::Upstream(_))));
    }
}
