//! OpenAI Chat Completions API driver.
//!
//! Implements [`LlmDriver`] for `/v1/chat/completions` with streaming and
//! function calling (`functions` + `function_call: "auto"`).

use futures::StreamExt;

use crate::normalized::NormalizedEvent;

use super::{EventStream, LlmDriver, LlmRequest, LlmSettings};

/// Accumulated state for a streaming function call.
#[derive(Default)]
struct FunctionAccum {
    name: Option<String>,
    args: String,
}

/// Driver for the OpenAI Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsDriver {
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn body(&self, req: LlmRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.settings.model,
            "stream": true,
            "messages": req.messages,
        });
        if !req.functions.is_empty() {
            body["functions"] = serde_json::Value::Array(req.functions);
            body["function_call"] = serde_json::Value::String("auto".to_string());
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
        let mut rb = self.http.post(self.url()).json(&self.body(req));
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }

        let resp = rb.send().await?.error_for_status()?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();
            let mut call = FunctionAccum::default();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                buf.extend_from_slice(&chunk);

                while let Some((pos, sep)) = find_frame_end(&buf) {
                    let frame = buf.drain(..pos + sep).collect::<Vec<_>>();
                    let text = String::from_utf8_lossy(&frame);

                    for line in text.lines() {
                        let line = line.trim();
                        if !line.starts_with("data:") {
                            continue;
                        }
                        let data = line.trim_start_matches("data:").trim();

                        if data == "[DONE]" {
                            yield NormalizedEvent::Done;
                            continue;
                        }

                        let v: serde_json::Value = serde_json::from_str(data)?;
                        let choice = &v["choices"][0];
                        let delta = &choice["delta"];

                        if let Some(s) = delta.get("content").and_then(|x| x.as_str()) {
                            if !s.is_empty() {
                                yield NormalizedEvent::MessageDelta { text: s.to_string() };
                            }
                        }

                        if let Some(fc) = delta.get("function_call").filter(|x| x.is_object()) {
                            let name = fc.get("name").and_then(|x| x.as_str()).map(ToString::to_string);
                            let arguments_delta = fc.get("arguments").and_then(|x| x.as_str()).map(ToString::to_string);

                            if call.name.is_none() {
                                call.name.clone_from(&name);
                            }
                            if let Some(ad) = &arguments_delta {
                                call.args.push_str(ad);
                            }

                            yield NormalizedEvent::FunctionCallDelta { name, arguments_delta };
                        }

                        if choice.get("finish_reason").and_then(|x| x.as_str()) == Some("function_call") {
                            if let Some(name) = call.name.take() {
                                yield NormalizedEvent::FunctionCallComplete {
                                    name,
                                    arguments_json: std::mem::take(&mut call.args),
                                };
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }
}

/// Position and length of the first SSE frame separator in the buffer.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}
