#![forbid(unsafe_code)]

pub mod auth;
pub mod completion;
mod sse;
pub mod transport;

use std::fmt;

use thiserror::Error;

pub use auth::{AuthBackend, HttpAuthBackend};
pub use completion::{CompletionBackend, CompletionRequest, ConnectionParams, DeltaStream, OpenAiCompletion};

/// Errors returned by the backend clients.
#[derive(Debug, Error)]
pub enum BackendError {
	#[error("transport error: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("backend rejected {call}: {detail}")]
	Rejected {
		call: &'static str,
		detail: String,
	},

	#[error("{call} failed: status={status} body={body}")]
	Status {
		call: &'static str,
		status: u16,
		body: String,
	},

	#[error("decode error: {0}")]
	Decode(#[from] serde_json::Error),

	#[error("invalid url: {0}")]
	Url(#[from] url::ParseError),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("completion stream error: {0}")]
	Stream(String),
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_redacts() {
		let s = SecretString::new("sk-live");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(serde_json::to_string(&s).unwrap(), "\"\"");
		assert_eq!(s.expose(), "sk-live");
	}
}
