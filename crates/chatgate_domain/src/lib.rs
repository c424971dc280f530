#![forbid(unsafe_code)]

pub mod acl;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use acl::{AclAction, AclError, AclSet, AclVerdict, CommandAcl, CommandGroup};

/// Session variants tracked by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
	/// Authenticated, audited session bound to a backend session record.
	Interactive,
	/// Anonymous session using the public completion settings.
	System,
}

impl SessionKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			SessionKind::Interactive => "interactive",
			SessionKind::System => "system",
		}
	}
}

impl fmt::Display for SessionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers and enum values from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("empty value")]
	Empty,
	#[error("unknown review state: {0}")]
	UnknownReviewState(String),
}

/// Conversation (session) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
	/// Create a non-empty `ConversationId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseError::Empty);
		}
		Ok(Self(id))
	}

	/// Random id for locally generated (system) sessions.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ConversationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ConversationId {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConversationId::new(s.to_string())
	}
}

/// Reviewer decision attached to a session by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReviewState {
	#[default]
	#[serde(rename = "wait")]
	Waiting,
	#[serde(rename = "accept")]
	Accepted,
	#[serde(rename = "reject")]
	Rejected,
	#[serde(rename = "cancel")]
	Cancelled,
}

impl ReviewState {
	/// Wire value.
	pub const fn as_str(self) -> &'static str {
		match self {
			ReviewState::Waiting => "wait",
			ReviewState::Accepted => "accept",
			ReviewState::Rejected => "reject",
			ReviewState::Cancelled => "cancel",
		}
	}
}

impl fmt::Display for ReviewState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ReviewState {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"wait" | "waiting" => Ok(ReviewState::Waiting),
			"accept" | "accepted" => Ok(ReviewState::Accepted),
			"reject" | "rejected" => Ok(ReviewState::Rejected),
			"cancel" | "cancelled" => Ok(ReviewState::Cancelled),
			other => Err(ParseError::UnknownReviewState(other.to_string())),
		}
	}
}

/// Risk classification recorded with every turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
	#[default]
	Normal,
	Warning,
	Reject,
}

impl RiskLevel {
	pub const fn as_str(self) -> &'static str {
		match self {
			RiskLevel::Normal => "normal",
			RiskLevel::Warning => "warning",
			RiskLevel::Reject => "reject",
		}
	}
}

impl fmt::Display for RiskLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One audited ask/answer pair.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TurnRecord {
	pub input: String,
	/// Empty until the relay completes (and for blocked turns).
	pub output: String,
	pub risk_level: RiskLevel,
	pub acl_id: Option<String>,
	pub group_id: Option<String>,
}

impl TurnRecord {
	pub fn new(input: impl Into<String>, verdict: &AclVerdict) -> Self {
		Self {
			input: input.into(),
			output: String::new(),
			risk_level: verdict.risk_level,
			acl_id: verdict.acl_id.clone(),
			group_id: verdict.group_id.clone(),
		}
	}
}
