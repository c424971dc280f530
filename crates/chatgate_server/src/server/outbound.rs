#![forbid(unsafe_code)]

use chatgate_protocol::{AskResponse, encode_response};
use tokio::sync::mpsc;
use tracing::warn;

/// Cloneable handle to a connection's single writer task.
///
/// Every frame is queued whole, so concurrent asks never tear each other's frames.
#[derive(Debug, Clone)]
pub struct Outbound {
	conn_id: u64,
	tx: mpsc::UnboundedSender<String>,
}

impl Outbound {
	pub fn channel(conn_id: u64) -> (Self, mpsc::UnboundedReceiver<String>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { conn_id, tx }, rx)
	}

	pub fn conn_id(&self) -> u64 {
		self.conn_id
	}

	/// Queue a raw text frame. Returns false once the writer is gone.
	pub fn send_text(&self, text: impl Into<String>) -> bool {
		if self.tx.send(text.into()).is_err() {
			metrics::counter!("chatgate_server_frame_write_failures_total").increment(1);
			return false;
		}
		metrics::counter!("chatgate_server_frames_out_total").increment(1);
		true
	}

	pub fn send_response(&self, resp: &AskResponse) -> bool {
		match encode_response(resp) {
			Ok(text) => self.send_text(text),
			Err(e) => {
				metrics::counter!("chatgate_server_frame_write_failures_total").increment(1);
				warn!(conn_id = self.conn_id, session_id = %resp.conversation_id, error = %e, "failed to encode frame");
				false
			}
		}
	}
}
