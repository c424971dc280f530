#![forbid(unsafe_code)]

use chatgate_domain::ReviewState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Keepalive text frame sent by clients.
pub const PING: &str = "ping";
/// Reply to [`PING`].
pub const PONG: &str = "pong";

/// Default maximum inbound text frame size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB

/// Role stamped on every relayed message.
pub const ASSISTANT_ROLE: &str = "assistant";

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("missing required field: {0}")]
	MissingField(&'static str),

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// One turn submitted by the client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AskRequest {
	/// Empty on the first ask of a connection.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub conversation_id: String,
	#[serde(default)]
	pub content: String,
	/// Optional system instruction for the session.
	#[serde(default)]
	pub prompt: String,
}

/// Decoded inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
	Ping,
	Ask(AskRequest),
}

/// Decode one inbound text frame.
pub fn decode_client_frame(text: &str, max_frame_size: usize) -> Result<ClientFrame, FrameError> {
	if text.len() > max_frame_size {
		return Err(FrameError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}

	if text == PING {
		return Ok(ClientFrame::Ping);
	}

	let ask: AskRequest = serde_json::from_str(text)?;
	Ok(ClientFrame::Ask(ask))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
	Message,
	Error,
	Finish,
}

/// Message body carried by `message` and `finish` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub content: String,
	/// Per-ask id shared by every frame of one turn.
	pub id: String,
	pub create_time: DateTime<Utc>,
	#[serde(rename = "type")]
	pub kind: ResponseType,
	pub role: String,
}

/// Outbound JSON frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskResponse {
	#[serde(rename = "type")]
	pub kind: ResponseType,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub conversation_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<ChatMessage>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub system_message: String,
}

impl AskResponse {
	pub fn error(conversation_id: impl Into<String>, system_message: impl Into<String>) -> Self {
		Self {
			kind: ResponseType::Error,
			conversation_id: conversation_id.into(),
			message: None,
			system_message: system_message.into(),
		}
	}

	/// `message` or `finish` frame for one ask. Outer and inner type match.
	pub fn chat(kind: ResponseType, conversation_id: impl Into<String>, ask_id: impl Into<String>, content: String) -> Self {
		Self {
			kind,
			conversation_id: conversation_id.into(),
			message: Some(ChatMessage {
				content,
				id: ask_id.into(),
				create_time: Utc::now(),
				kind,
				role: ASSISTANT_ROLE.to_string(),
			}),
			system_message: String::new(),
		}
	}

	/// Terminal notice for a closed session (no message body).
	pub fn closed(conversation_id: impl Into<String>, reason: impl Into<String>) -> Self {
		Self {
			kind: ResponseType::Finish,
			conversation_id: conversation_id.into(),
			message: None,
			system_message: reason.into(),
		}
	}

	pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
		self.system_message = system_message.into();
		self
	}

	pub fn content(&self) -> Option<&str> {
		self.message.as_ref().map(|m| m.content.as_str())
	}
}

/// Serialize an outbound frame to its text form.
pub fn encode_response(resp: &AskResponse) -> Result<String, FrameError> {
	Ok(serde_json::to_string(resp)?)
}

/// Body of the interrupt control request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterruptRequest {
	pub id: String,
}

impl InterruptRequest {
	pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
		let req: Self = serde_json::from_slice(body)?;
		if req.id.trim().is_empty() {
			return Err(FrameError::MissingField("id"));
		}
		Ok(req)
	}
}

/// Body of the review-state control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewStateRequest {
	pub id: String,
	pub activate_review: ReviewState,
}

impl ReviewStateRequest {
	pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
		let req: Self = serde_json::from_slice(body)?;
		if req.id.trim().is_empty() {
			return Err(FrameError::MissingField("id"));
		}
		Ok(req)
	}
}
