#![forbid(unsafe_code)]

//! Out-of-band requests against live sessions.

use chatgate_protocol::{InterruptRequest, ReviewStateRequest};
use hyper::StatusCode;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::server::registry::SessionRegistry;

pub type ControlReply = (StatusCode, Value);

fn success() -> ControlReply {
	(StatusCode::OK, json!({ "message": "Success" }))
}

fn not_found() -> ControlReply {
	(StatusCode::NOT_FOUND, json!({ "message": "not found conversation" }))
}

fn invalid() -> ControlReply {
	(StatusCode::BAD_REQUEST, json!({ "error": "Invalid data" }))
}

/// Cancel the in-flight ask of an interactive or system session.
pub fn interrupt_current_ask(registry: &SessionRegistry, body: &[u8]) -> ControlReply {
	let req = match InterruptRequest::decode(body) {
		Ok(r) => r,
		Err(e) => {
			debug!(error = %e, "invalid interrupt request");
			return invalid();
		}
	};

	let Some(handle) = registry.lookup(&req.id) else {
		return not_found();
	};

	let interrupted = handle.interrupt();
	info!(session_id = %req.id, interrupted, "interrupt requested");
	metrics::counter!("chatgate_server_interrupts_total").increment(1);
	success()
}

/// Store the reviewer decision on an interactive session.
pub fn set_review_state(registry: &SessionRegistry, body: &[u8]) -> ControlReply {
	let req = match ReviewStateRequest::decode(body) {
		Ok(r) => r,
		Err(e) => {
			debug!(error = %e, "invalid review state request");
			return invalid();
		}
	};

	match registry.lookup_interactive(&req.id) {
		Ok(session) => {
			session.core().set_review(req.activate_review);
			info!(session_id = %req.id, review = %req.activate_review, "review state updated");
			success()
		}
		Err(e) => {
			debug!(error = %e, "review state for unknown session");
			not_found()
		}
	}
}
