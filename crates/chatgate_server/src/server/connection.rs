#![forbid(unsafe_code)]

use std::sync::Arc;

use chatgate_backend::auth::{PublicSetting, TokenAuthInfo};
use chatgate_domain::SessionKind;
use chatgate_protocol::{AskRequest, AskResponse, ClientFrame, PONG, decode_client_frame};
use futures::future::join_all;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::outbound::Outbound;
use crate::server::session::{InteractiveSession, SessionHandle, SystemSession};
use crate::server::state::GatewayState;

pub const SESSION_NOT_FOUND: &str = "current session not found";
pub const INVALID_REQUEST: &str = "invalid request";
pub const CREATE_FAILED: &str = "failed to create session";
pub const CONNECTION_CLOSED_REASON: &str = "websocket closed, session interrupted";

/// Who is on the other end, resolved before the upgrade.
#[derive(Debug, Clone)]
pub enum Identity {
	Interactive {
		auth_info: Arc<TokenAuthInfo>,
		remote_addr: String,
	},
	System {
		setting: Arc<PublicSetting>,
	},
}

impl Identity {
	pub fn kind(&self) -> SessionKind {
		match self {
			Identity::Interactive { .. } => SessionKind::Interactive,
			Identity::System { .. } => SessionKind::System,
		}
	}
}

enum Flow {
	Continue,
	Stop,
}

pub async fn handle_connection<S>(
	conn_id: u64,
	ws: WebSocketStream<S>,
	identity: Identity,
	state: Arc<GatewayState>,
) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("chatgate_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("chatgate_server_active_connections").increment(1.0);
	metrics::counter!("chatgate_server_connections_total", "kind" => identity.kind().as_str()).increment(1);
	let _conn_guard = ConnectionGaugeGuard;

	let (sink, mut stream) = ws.split();
	let (outbound, rx) = Outbound::channel(conn_id);
	let shutdown = CancellationToken::new();
	let writer = tokio::spawn(run_writer(conn_id, sink, rx, shutdown.clone()));

	info!(conn_id, kind = identity.kind().as_str(), "websocket connection established");

	let mut owned: Vec<SessionHandle> = Vec::new();
	while let Some(msg) = stream.next().await {
		let msg = match msg {
			Ok(m) => m,
			Err(e) => {
				debug!(conn_id, error = %e, "websocket read failed");
				break;
			}
		};

		let flow = match msg {
			Message::Text(text) => {
				metrics::counter!("chatgate_server_frames_in_total").increment(1);
				handle_text(text.as_str(), &identity, &state, &outbound, &mut owned).await
			}
			Message::Close(_) => Flow::Stop,
			Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Flow::Continue,
		};

		if let Flow::Stop = flow {
			break;
		}
	}

	if !owned.is_empty() {
		info!(conn_id, sessions = owned.len(), "closing sessions owned by connection");
		join_all(owned.iter().map(|h| h.close(CONNECTION_CLOSED_REASON))).await;
	}

	shutdown.cancel();
	drop(outbound);
	if let Err(e) = writer.await {
		warn!(conn_id, error = %e, "websocket writer task failed");
	}

	info!(conn_id, "websocket connection closed");
	Ok(())
}

async fn handle_text(
	text: &str,
	identity: &Identity,
	state: &Arc<GatewayState>,
	outbound: &Outbound,
	owned: &mut Vec<SessionHandle>,
) -> Flow {
	let req = match decode_client_frame(text, state.settings.max_frame_size) {
		Ok(ClientFrame::Ping) => {
			outbound.send_text(PONG);
			return Flow::Continue;
		}
		Ok(ClientFrame::Ask(req)) => req,
		Err(e) => {
			debug!(conn_id = outbound.conn_id(), error = %e, "malformed ask frame");
			outbound.send_response(&AskResponse::error("", INVALID_REQUEST));
			return Flow::Continue;
		}
	};

	let handle = if req.conversation_id.is_empty() {
		match open_session(identity, state, &req, outbound).await {
			Ok(h) => {
				owned.push(h.clone());
				h
			}
			Err(e) => {
				warn!(conn_id = outbound.conn_id(), error = %e, "failed to create session");
				outbound.send_response(&AskResponse::error("", CREATE_FAILED));
				return Flow::Continue;
			}
		}
	} else {
		match state.registry.lookup_kind(&req.conversation_id, identity.kind()) {
			Ok(h) => {
				h.mark_new_dialogue();
				h
			}
			Err(e) => {
				debug!(conn_id = outbound.conn_id(), error = %e, "ask for unknown session");
				outbound.send_response(&AskResponse::error(req.conversation_id.as_str(), SESSION_NOT_FOUND));
				return Flow::Stop;
			}
		}
	};

	handle.ask(req.content, outbound.clone());
	Flow::Continue
}

async fn open_session(
	identity: &Identity,
	state: &Arc<GatewayState>,
	req: &AskRequest,
	outbound: &Outbound,
) -> anyhow::Result<SessionHandle> {
	match identity {
		Identity::Interactive { auth_info, remote_addr } => {
			InteractiveSession::activate(state, auth_info, remote_addr, &req.prompt, outbound.clone())
				.await
				.map(SessionHandle::Interactive)
		}
		Identity::System { setting } => Ok(SessionHandle::System(SystemSession::activate(
			state,
			setting,
			&req.prompt,
			outbound.clone(),
		))),
	}
}

/// Sole owner of the socket sink; drains what is queued once `shutdown` fires.
async fn run_writer<W>(conn_id: u64, mut sink: W, mut rx: mpsc::UnboundedReceiver<String>, shutdown: CancellationToken)
where
	W: futures_util::Sink<Message> + Unpin,
	W::Error: std::fmt::Display,
{
	loop {
		let text = tokio::select! {
			biased;
			t = rx.recv() => match t {
				Some(t) => t,
				None => break,
			},
			_ = shutdown.cancelled() => {
				while let Ok(t) = rx.try_recv() {
					if sink.send(Message::text(t)).await.is_err() {
						break;
					}
				}
				break;
			}
		};

		if let Err(e) = sink.send(Message::text(text)).await {
			metrics::counter!("chatgate_server_frame_write_failures_total").increment(1);
			warn!(conn_id, error = %e, "websocket write failed");
			return;
		}
	}

	let _ = sink.close().await;
}
