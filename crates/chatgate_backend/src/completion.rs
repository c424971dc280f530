#![forbid(unsafe_code)]

//! OpenAI-compatible streaming chat completion client.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::sse::SseDataStream;
use crate::transport::{TransportOptions, build_client};
use crate::{BackendError, SecretString};

const CHAT_COMPLETIONS_PATH: &str = "chat/completions";
const DONE_SENTINEL: &str = "[DONE]";

/// Incremental text deltas; ends after the backend's terminal marker.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	System,
	User,
	Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
	pub role: Role,
	pub content: String,
}

impl ChatTurn {
	pub fn system(content: impl Into<String>) -> Self {
		Self {
			role: Role::System,
			content: content.into(),
		}
	}

	pub fn user(content: impl Into<String>) -> Self {
		Self {
			role: Role::User,
			content: content.into(),
		}
	}
}

/// One streaming completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
	pub model: String,
	pub messages: Vec<ChatTurn>,
}

/// Where and how to reach a completion endpoint.
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams {
	pub api_key: SecretString,
	pub base_url: String,
	pub proxy: Option<String>,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync + 'static {
	/// Open one streaming exchange. Dropping the stream aborts the remote call.
	async fn stream_chat(&self, params: &ConnectionParams, req: CompletionRequest) -> Result<DeltaStream, BackendError>;
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
	model: &'a str,
	messages: &'a [ChatTurn],
	stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
	#[serde(default)]
	choices: Vec<WireChoice>,
	#[serde(default)]
	error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
	#[serde(default)]
	delta: WireDelta,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
	#[serde(default)]
	content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
	#[serde(default)]
	message: String,
}

/// Decode one `data:` payload into its text delta (if any).
fn decode_chunk(data: &str) -> Result<Option<String>, BackendError> {
	let chunk: WireChunk = serde_json::from_str(data)?;
	if let Some(err) = chunk.error {
		return Err(BackendError::Stream(err.message));
	}

	Ok(chunk
		.choices
		.into_iter()
		.next()
		.and_then(|c| c.delta.content)
		.filter(|c| !c.is_empty()))
}

/// Join `base_url` and the completions path, tolerating trailing slashes.
fn completions_url(base_url: &str) -> Result<url::Url, BackendError> {
	let base = base_url.trim().trim_end_matches('/');
	let base = if base.is_empty() { "https://api.openai.com/v1" } else { base };
	Ok(url::Url::parse(&format!("{base}/"))?.join(CHAT_COMPLETIONS_PATH)?)
}

/// `CompletionBackend` speaking the OpenAI chat completions SSE dialect.
#[derive(Debug, Clone, Default)]
pub struct OpenAiCompletion;

impl OpenAiCompletion {
	pub fn new() -> Self {
		Self
	}
}

#[async_trait]
impl CompletionBackend for OpenAiCompletion {
	async fn stream_chat(&self, params: &ConnectionParams, req: CompletionRequest) -> Result<DeltaStream, BackendError> {
		let http = build_client(&TransportOptions::completion(params.proxy.as_deref()))?;
		let url = completions_url(&params.base_url)?;

		let body = WireRequest {
			model: &req.model,
			messages: &req.messages,
			stream: true,
		};

		let resp = http
			.post(url)
			.bearer_auth(params.api_key.expose())
			.header(reqwest::header::ACCEPT, "text/event-stream")
			.json(&body)
			.send()
			.await?;

		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			metrics::counter!("chatgate_backend_requests_total", "call" => "chat_completions", "outcome" => "status")
				.increment(1);
			return Err(BackendError::Status {
				call: "chat_completions",
				status: status.as_u16(),
				body,
			});
		}

		metrics::counter!("chatgate_backend_requests_total", "call" => "chat_completions", "outcome" => "ok").increment(1);

		let lines = SseDataStream::new(Box::pin(resp.bytes_stream()));
		let deltas = futures::stream::unfold(Some(lines), |state| async move {
			let mut lines = state?;
			loop {
				match lines.next().await {
					None => return None,
					Some(Err(e)) => return Some((Err(BackendError::Transport(e)), None)),
					Some(Ok(data)) => {
						if data.trim() == DONE_SENTINEL {
							return None;
						}
						match decode_chunk(&data) {
							Ok(Some(delta)) => return Some((Ok(delta), Some(lines))),
							Ok(None) => continue,
							Err(e) => return Some((Err(e), None)),
						}
					}
				}
			}
		});

		Ok(Box::pin(deltas))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decode_chunk_extracts_delta_content() {
		let d = decode_chunk(r#"{"choices":[{"delta":{"content":"He"}}]}"#).unwrap();
		assert_eq!(d.as_deref(), Some("He"));
	}

	#[test]
	fn decode_chunk_skips_role_only_and_empty_deltas() {
		assert!(decode_chunk(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap().is_none());
		assert!(decode_chunk(r#"{"choices":[{"delta":{"content":""}}]}"#).unwrap().is_none());
		assert!(decode_chunk(r#"{"choices":[]}"#).unwrap().is_none());
	}

	#[test]
	fn decode_chunk_surfaces_inline_errors() {
		let err = decode_chunk(r#"{"error":{"message":"quota exceeded"}}"#).unwrap_err();
		assert!(matches!(err, BackendError::Stream(m) if m == "quota exceeded"));
	}

	#[test]
	fn completions_url_joins_cleanly() {
		assert_eq!(
			completions_url("http://llm.local/v1/").unwrap().as_str(),
			"http://llm.local/v1/chat/completions"
		);
		assert_eq!(
			completions_url("http://llm.local/v1").unwrap().as_str(),
			"http://llm.local/v1/chat/completions"
		);
		assert_eq!(
			completions_url("").unwrap().as_str(),
			"https://api.openai.com/v1/chat/completions"
		);
	}
}
