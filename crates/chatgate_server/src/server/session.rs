#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use chatgate_backend::auth::{PublicSetting, SessionCreate, TokenAuthInfo};
use chatgate_backend::{CompletionBackend, ConnectionParams};
use chatgate_domain::{AclSet, AclVerdict, ConversationId, ReviewState, SessionKind};
use chatgate_protocol::{AskResponse, ResponseType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::server::outbound::Outbound;
use crate::server::pipeline::{AuditOutcome, AuditPipeline, CommandContext};
use crate::server::relay::{Finish, RelayEvent, RelayOutcome, RelayRequest, relay};
use crate::server::replay::ReplayRecorder;
use crate::server::state::GatewayState;
use crate::server::watchdog::{self, Budgets};
use crate::util::time::unix_secs_now;

/// Used when neither the platform nor the public setting names a model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
	Created,
	Active,
	Closing,
	Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleCheck {
	Alive,
	Expired,
}

struct SessionState {
	history: Vec<String>,
	review: ReviewState,
	lifecycle: LifecycleState,
	current_ask: Option<(String, CancellationToken)>,
	new_dialogue: bool,
	last_active: Instant,
}

/// One accepted ask, ready to run.
#[derive(Debug, Clone)]
pub struct PendingAsk {
	pub ask_id: String,
	/// History snapshot including this ask's content.
	pub history: Vec<String>,
	pub cancel: CancellationToken,
	/// Writer of the connection that sent the ask.
	pub outbound: Outbound,
}

/// State shared by both session kinds.
pub struct SessionCore {
	id: ConversationId,
	kind: SessionKind,
	prompt: String,
	model: String,
	params: ConnectionParams,
	cancel: CancellationToken,
	outbound: Outbound,
	state: Mutex<SessionState>,
}

impl SessionCore {
	fn new(
		id: ConversationId,
		kind: SessionKind,
		prompt: String,
		model: String,
		params: ConnectionParams,
		outbound: Outbound,
	) -> Self {
		Self {
			id,
			kind,
			prompt,
			model,
			params,
			cancel: CancellationToken::new(),
			outbound,
			state: Mutex::new(SessionState {
				history: Vec::new(),
				review: ReviewState::default(),
				lifecycle: LifecycleState::Created,
				current_ask: None,
				new_dialogue: false,
				last_active: Instant::now(),
			}),
		}
	}

	pub fn id(&self) -> &ConversationId {
		&self.id
	}

	pub fn kind(&self) -> SessionKind {
		self.kind
	}

	pub fn model(&self) -> &str {
		&self.model
	}

	pub fn prompt(&self) -> &str {
		&self.prompt
	}

	/// Session-wide token; every ask token is a child of it.
	pub fn cancel_token(&self) -> &CancellationToken {
		&self.cancel
	}

	pub fn lifecycle(&self) -> LifecycleState {
		self.state.lock().lifecycle
	}

	pub fn history(&self) -> Vec<String> {
		self.state.lock().history.clone()
	}

	pub fn review(&self) -> ReviewState {
		self.state.lock().review
	}

	pub fn set_review(&self, review: ReviewState) {
		self.state.lock().review = review;
	}

	pub fn mark_new_dialogue(&self) {
		self.state.lock().new_dialogue = true;
	}

	fn activate(&self) {
		let mut st = self.state.lock();
		st.lifecycle = LifecycleState::Active;
		st.last_active = Instant::now();
	}

	/// Append `content` and hand out a fresh ask token. `None` unless active.
	pub fn begin_ask(&self, content: &str, outbound: Outbound) -> Option<PendingAsk> {
		let mut st = self.state.lock();
		if st.lifecycle != LifecycleState::Active {
			return None;
		}

		st.history.push(content.to_string());
		let ask_id = uuid::Uuid::new_v4().to_string();
		let cancel = self.cancel.child_token();
		st.current_ask = Some((ask_id.clone(), cancel.clone()));

		Some(PendingAsk {
			ask_id,
			history: st.history.clone(),
			cancel,
			outbound,
		})
	}

	fn end_ask(&self, ask_id: &str) {
		let mut st = self.state.lock();
		if st.current_ask.as_ref().is_some_and(|(id, _)| id == ask_id) {
			st.current_ask = None;
		}
	}

	/// Cancel only the latest ask. Returns whether one was in flight.
	pub fn interrupt(&self) -> bool {
		let current = self.state.lock().current_ask.take();
		match current {
			Some((ask_id, token)) => {
				token.cancel();
				debug!(session_id = %self.id, ask_id = %ask_id, "ask interrupted");
				true
			}
			None => false,
		}
	}

	/// One idle-watchdog poll: expiry is checked before the marker resets the clock.
	pub fn poll_idle(&self, budget: std::time::Duration) -> IdleCheck {
		let mut st = self.state.lock();
		if st.last_active.elapsed() >= budget {
			return IdleCheck::Expired;
		}
		if st.new_dialogue {
			st.last_active = Instant::now();
			st.new_dialogue = false;
		}
		IdleCheck::Alive
	}

	/// Flip to `Closing`. False when a close already started.
	fn begin_close(&self) -> bool {
		let mut st = self.state.lock();
		match st.lifecycle {
			LifecycleState::Closing | LifecycleState::Closed => false,
			LifecycleState::Created | LifecycleState::Active => {
				st.lifecycle = LifecycleState::Closing;
				st.current_ask = None;
				true
			}
		}
	}

	fn finish_close(&self, reason: &str) {
		self.state.lock().lifecycle = LifecycleState::Closed;
		self.outbound.send_response(&AskResponse::closed(self.id.as_str(), reason));
	}

	/// Translate a relay event into its outbound frame.
	pub fn emit(&self, out: &Outbound, ask_id: &str, event: RelayEvent) {
		let resp = match event {
			RelayEvent::Answer(content) => AskResponse::chat(ResponseType::Message, self.id.as_str(), ask_id, content),
			RelayEvent::Done(RelayOutcome { content, finish }) => {
				let resp = AskResponse::chat(ResponseType::Finish, self.id.as_str(), ask_id, content);
				match finish {
					Finish::Failed(reason) => resp.with_system_message(reason),
					Finish::Completed | Finish::Cancelled => resp,
				}
			}
		};
		out.send_response(&resp);
	}

	async fn relay_ask(&self, backend: &dyn CompletionBackend, ask: &PendingAsk) -> RelayOutcome {
		let req = RelayRequest {
			history: ask.history.clone(),
			system_prompt: self.prompt.clone(),
			model: self.model.clone(),
			params: self.params.clone(),
		};
		relay(backend, req, &ask.cancel, |event| self.emit(&ask.outbound, &ask.ask_id, event)).await
	}
}

/// Authenticated, audited session bound to a backend session record.
pub struct InteractiveSession {
	core: SessionCore,
	pipeline: AuditPipeline,
	budgets: Budgets,
	expires_at: Option<DateTime<Utc>>,
	state: Arc<GatewayState>,
}

impl InteractiveSession {
	/// Create the backend session record, then activate, register and start the watchdogs.
	pub async fn activate(
		state: &Arc<GatewayState>,
		info: &TokenAuthInfo,
		remote_addr: &str,
		prompt: &str,
		outbound: Outbound,
	) -> anyhow::Result<Arc<Self>> {
		let create = SessionCreate::from_auth_info(info, remote_addr, unix_secs_now());
		let record = state
			.auth
			.create_session(&create)
			.await
			.context("create backend session")?;
		let id = ConversationId::new(record.id.clone()).context("backend returned an empty session id")?;

		let (acls, errors) = AclSet::compile(&info.filter_rules);
		for e in errors {
			warn!(session_id = %id, error = %e, "skipping command acl group");
		}

		let transcript = ReplayRecorder::spawn(&state.settings.replay_dir, id.as_str());
		let context = CommandContext {
			org_id: record.org_id.clone(),
			asset: record.asset.clone(),
			account: record.account.clone(),
			user: record.user.clone(),
		};
		let pipeline = AuditPipeline::new(
			id.as_str(),
			acls,
			transcript,
			context,
			Arc::clone(&state.auth),
			Arc::clone(&state.audit),
		);

		let params = ConnectionParams {
			api_key: info.account.secret.clone(),
			base_url: info.asset.address.clone(),
			proxy: info.proxy().map(str::to_string),
		};
		let model = info.model().filter(|m| !m.trim().is_empty()).unwrap_or(DEFAULT_MODEL);

		let session = Arc::new(Self {
			core: SessionCore::new(
				id.clone(),
				SessionKind::Interactive,
				state.system_prompt(prompt),
				model.to_string(),
				params,
				outbound,
			),
			pipeline,
			budgets: Budgets {
				idle_minutes: info.setting.max_idle_time,
				max_hours: info.setting.max_session_time,
			},
			expires_at: DateTime::from_timestamp(info.expire_info.expire_at, 0).filter(|_| info.expire_info.expire_at > 0),
			state: Arc::clone(state),
		});

		session.core.activate();
		state.registry.register(SessionHandle::Interactive(Arc::clone(&session)));
		watchdog::spawn(&session, state.settings.watchdog_poll);

		info!(
			session_id = %id,
			conn_id = session.core.outbound.conn_id(),
			user = %record.user,
			asset = %record.asset,
			model = %session.core.model,
			acl_rules = session.pipeline.rule_count(),
			idle_minutes = session.budgets.idle_minutes,
			max_hours = session.budgets.max_hours,
			expires_at = ?session.expires_at,
			"interactive session activated"
		);
		metrics::counter!("chatgate_server_sessions_opened_total", "kind" => SessionKind::Interactive.as_str()).increment(1);

		Ok(session)
	}

	pub fn core(&self) -> &SessionCore {
		&self.core
	}

	pub fn budgets(&self) -> Budgets {
		self.budgets
	}

	pub fn expires_at(&self) -> Option<DateTime<Utc>> {
		self.expires_at
	}

	pub fn transcript(&self) -> &ReplayRecorder {
		self.pipeline.transcript()
	}

	async fn run_ask(&self, ask: &PendingAsk, content: &str) {
		let core = &self.core;
		let completion = self.state.completion.as_ref();

		let outcome = self
			.pipeline
			.with_audit(content, || async move { core.relay_ask(completion, ask).await.content })
			.await;

		if let AuditOutcome::Blocked(verdict) = outcome {
			self.finish_blocked(ask, &verdict);
		}
	}

	/// A blocked ask ends like any other turn, with nothing forwarded.
	fn finish_blocked(&self, ask: &PendingAsk, verdict: &AclVerdict) {
		debug!(
			session_id = %self.core.id,
			ask_id = %ask.ask_id,
			acl_id = verdict.acl_id.as_deref().unwrap_or_default(),
			"ask finished without relay"
		);
		let resp = AskResponse::chat(ResponseType::Finish, self.core.id.as_str(), &ask.ask_id, String::new());
		ask.outbound.send_response(&resp);
	}

	/// Idempotent; only the first call tears the session down.
	pub async fn close(&self, reason: &str) {
		if !self.core.begin_close() {
			debug!(session_id = %self.core.id, "session already closing");
			return;
		}
		info!(session_id = %self.core.id, reason = %reason, "closing interactive session");

		self.core.cancel.cancel();
		tokio::time::sleep(self.state.settings.close_grace).await;

		let id = self.core.id.as_str();
		match self.pipeline.transcript().finish().await {
			Ok(path) => {
				if let Err(e) = self.state.auth.upload_replay(id, &path).await {
					metrics::counter!("chatgate_server_background_failures_total", "kind" => "upload_replay").increment(1);
					warn!(session_id = %id, error = %e, "failed to upload replay");
				}
			}
			Err(e) => {
				metrics::counter!("chatgate_server_background_failures_total", "kind" => "transcript").increment(1);
				warn!(session_id = %id, error = %e, "failed to finish transcript");
			}
		}

		if let Err(e) = self.state.auth.finish_session(id, unix_secs_now()).await {
			metrics::counter!("chatgate_server_background_failures_total", "kind" => "finish_session").increment(1);
			warn!(session_id = %id, error = %e, "failed to finish backend session");
		}

		self.state.registry.unregister(&self.core.id);
		self.core.finish_close(reason);
		metrics::counter!("chatgate_server_sessions_closed_total", "kind" => SessionKind::Interactive.as_str()).increment(1);
	}
}

/// Anonymous session using the public completion settings.
pub struct SystemSession {
	core: SessionCore,
	state: Arc<GatewayState>,
}

impl SystemSession {
	pub fn activate(state: &Arc<GatewayState>, setting: &PublicSetting, prompt: &str, outbound: Outbound) -> Arc<Self> {
		let params = ConnectionParams {
			api_key: setting.gpt_api_key.clone(),
			base_url: setting.gpt_base_url.clone(),
			proxy: Some(setting.gpt_proxy.trim())
				.filter(|p| !p.is_empty())
				.map(str::to_string),
		};
		let model = Some(setting.gpt_model.trim())
			.filter(|m| !m.is_empty())
			.unwrap_or(DEFAULT_MODEL);

		let session = Arc::new(Self {
			core: SessionCore::new(
				ConversationId::new_v4(),
				SessionKind::System,
				state.system_prompt(prompt),
				model.to_string(),
				params,
				outbound,
			),
			state: Arc::clone(state),
		});

		session.core.activate();
		state.registry.register(SessionHandle::System(Arc::clone(&session)));

		info!(
			session_id = %session.core.id,
			conn_id = session.core.outbound.conn_id(),
			model = %session.core.model,
			"system session activated"
		);
		metrics::counter!("chatgate_server_sessions_opened_total", "kind" => SessionKind::System.as_str()).increment(1);

		session
	}

	pub fn core(&self) -> &SessionCore {
		&self.core
	}

	async fn run_ask(&self, ask: &PendingAsk) {
		self.core.relay_ask(self.state.completion.as_ref(), ask).await;
	}

	pub async fn close(&self, reason: &str) {
		if !self.core.begin_close() {
			debug!(session_id = %self.core.id, "session already closing");
			return;
		}
		info!(session_id = %self.core.id, reason = %reason, "closing system session");

		self.core.cancel.cancel();
		tokio::time::sleep(self.state.settings.close_grace).await;

		self.state.registry.unregister(&self.core.id);
		self.core.finish_close(reason);
		metrics::counter!("chatgate_server_sessions_closed_total", "kind" => SessionKind::System.as_str()).increment(1);
	}
}

/// Registry entry: one of the two session kinds.
#[derive(Clone)]
pub enum SessionHandle {
	Interactive(Arc<InteractiveSession>),
	System(Arc<SystemSession>),
}

impl SessionHandle {
	pub fn core(&self) -> &SessionCore {
		match self {
			SessionHandle::Interactive(s) => &s.core,
			SessionHandle::System(s) => &s.core,
		}
	}

	pub fn id(&self) -> &ConversationId {
		self.core().id()
	}

	pub fn kind(&self) -> SessionKind {
		self.core().kind()
	}

	pub fn mark_new_dialogue(&self) {
		self.core().mark_new_dialogue();
	}

	pub fn interrupt(&self) -> bool {
		self.core().interrupt()
	}

	/// Record `content` and run the turn on its own task; frames go to `outbound`.
	pub fn ask(&self, content: String, outbound: Outbound) -> Option<JoinHandle<()>> {
		let core = self.core();
		let Some(ask) = core.begin_ask(&content, outbound) else {
			warn!(session_id = %core.id, "ask dropped; session is not active");
			return None;
		};

		metrics::counter!("chatgate_server_asks_total", "kind" => core.kind.as_str()).increment(1);
		let span = info_span!("ask", session_id = %core.id, ask_id = %ask.ask_id);
		let handle = self.clone();

		Some(tokio::spawn(
			async move {
				match &handle {
					SessionHandle::Interactive(s) => s.run_ask(&ask, &content).await,
					SessionHandle::System(s) => s.run_ask(&ask).await,
				}
				handle.core().end_ask(&ask.ask_id);
			}
			.instrument(span),
		))
	}

	pub async fn close(&self, reason: &str) {
		match self {
			SessionHandle::Interactive(s) => s.close(reason).await,
			SessionHandle::System(s) => s.close(reason).await,
		}
	}
}
