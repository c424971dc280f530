#![forbid(unsafe_code)]

use std::sync::Arc;

use chatgate_domain::{ConversationId, SessionKind};
use dashmap::DashMap;
use thiserror::Error;

use crate::server::session::{InteractiveSession, SessionHandle, SystemSession};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
	#[error("session not found: {0}")]
	NotFound(String),

	#[error("session {id} is {actual}, expected {expected}")]
	KindMismatch {
		id: String,
		expected: SessionKind,
		actual: SessionKind,
	},
}

/// Live sessions of both kinds, keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
	sessions: DashMap<ConversationId, SessionHandle>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Store under the session's own id, replacing any previous entry.
	pub fn register(&self, handle: SessionHandle) -> ConversationId {
		let id = handle.id().clone();
		self.sessions.insert(id.clone(), handle);
		metrics::gauge!("chatgate_server_active_sessions").set(self.sessions.len() as f64);
		id
	}

	/// Remove by id; absent ids are ignored.
	pub fn unregister(&self, id: &ConversationId) -> bool {
		let removed = self.sessions.remove(id).is_some();
		metrics::gauge!("chatgate_server_active_sessions").set(self.sessions.len() as f64);
		removed
	}

	pub fn lookup(&self, id: &str) -> Option<SessionHandle> {
		let id = ConversationId::new(id).ok()?;
		self.sessions.get(&id).map(|e| e.value().clone())
	}

	pub fn lookup_interactive(&self, id: &str) -> Result<Arc<InteractiveSession>, LookupError> {
		match self.lookup(id) {
			Some(SessionHandle::Interactive(s)) => Ok(s),
			Some(other) => Err(LookupError::KindMismatch {
				id: id.to_string(),
				expected: SessionKind::Interactive,
				actual: other.kind(),
			}),
			None => Err(LookupError::NotFound(id.to_string())),
		}
	}

	pub fn lookup_system(&self, id: &str) -> Result<Arc<SystemSession>, LookupError> {
		match self.lookup(id) {
			Some(SessionHandle::System(s)) => Ok(s),
			Some(other) => Err(LookupError::KindMismatch {
				id: id.to_string(),
				expected: SessionKind::System,
				actual: other.kind(),
			}),
			None => Err(LookupError::NotFound(id.to_string())),
		}
	}

	/// Lookup constrained to one kind.
	pub fn lookup_kind(&self, id: &str, kind: SessionKind) -> Result<SessionHandle, LookupError> {
		match kind {
			SessionKind::Interactive => self.lookup_interactive(id).map(SessionHandle::Interactive),
			SessionKind::System => self.lookup_system(id).map(SessionHandle::System),
		}
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}

	/// Snapshot of every registered handle.
	pub fn handles(&self) -> Vec<SessionHandle> {
		self.sessions.iter().map(|e| e.value().clone()).collect()
	}

	pub fn ids(&self) -> Vec<ConversationId> {
		self.sessions.iter().map(|e| e.key().clone()).collect()
	}
}
