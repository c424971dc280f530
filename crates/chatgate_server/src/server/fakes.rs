#![forbid(unsafe_code)]

//! In-process stand-ins for the two backends.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatgate_backend::auth::{
	Account, Asset, AssetSpecific, CommandRecord, Cookie, PlatformProtocol, Protocol, PublicSetting, SessionCreate,
	SessionRecord, SessionSetting, TokenAuthInfo, User,
};
use chatgate_backend::{AuthBackend, BackendError, CompletionBackend, CompletionRequest, ConnectionParams, DeltaStream};
use chatgate_domain::CommandAcl;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::server::audit::AuditService;
use crate::server::state::{GatewayState, SessionSettings};

pub(crate) const GOOD_TOKEN: &str = "good-token";
pub(crate) const SESSION_COOKIE: &str = "sessionid";

#[derive(Default)]
pub(crate) struct FakeAuth {
	pub fail_create: bool,
	pub auth_info: TokenAuthInfo,
	next_id: AtomicUsize,
	pub created: Mutex<Vec<SessionCreate>>,
	pub finished: Mutex<Vec<String>>,
	pub commands: Mutex<Vec<CommandRecord>>,
	pub replays: Mutex<Vec<(String, PathBuf)>>,
}

impl FakeAuth {
	pub fn new(auth_info: TokenAuthInfo) -> Self {
		Self {
			auth_info,
			..Self::default()
		}
	}

	pub fn failing() -> Self {
		Self {
			fail_create: true,
			..Self::default()
		}
	}

	pub fn commands(&self) -> Vec<CommandRecord> {
		self.commands.lock().clone()
	}

	pub fn finished(&self) -> Vec<String> {
		self.finished.lock().clone()
	}

	pub fn replays(&self) -> Vec<(String, PathBuf)> {
		self.replays.lock().clone()
	}
}

#[async_trait]
impl AuthBackend for FakeAuth {
	async fn check_user_by_cookies(&self, cookies: &[Cookie]) -> Result<User, BackendError> {
		if cookies.iter().any(|c| c.name == SESSION_COOKIE && !c.value.is_empty()) {
			Ok(self.auth_info.user.clone())
		} else {
			Err(BackendError::Rejected {
				call: "check_user_by_cookies",
				detail: "not logged in".to_string(),
			})
		}
	}

	async fn get_token_auth_info(&self, token: &str) -> Result<TokenAuthInfo, BackendError> {
		if token == GOOD_TOKEN {
			Ok(self.auth_info.clone())
		} else {
			Err(BackendError::Rejected {
				call: "get_token_auth_info",
				detail: "token invalid".to_string(),
			})
		}
	}

	async fn create_session(&self, req: &SessionCreate) -> Result<SessionRecord, BackendError> {
		if self.fail_create {
			return Err(BackendError::Rejected {
				call: "create_session",
				detail: "quota exceeded".to_string(),
			});
		}

		self.created.lock().push(req.clone());
		let n = self.next_id.fetch_add(1, Ordering::SeqCst);
		Ok(SessionRecord {
			id: format!("sess-{n}-{}", uuid::Uuid::new_v4()),
			user: req.user.clone(),
			account: req.account.clone(),
			asset: req.asset.clone(),
			org_id: req.org_id.clone(),
		})
	}

	async fn finish_session(&self, session_id: &str, _date_end: i64) -> Result<(), BackendError> {
		self.finished.lock().push(session_id.to_string());
		Ok(())
	}

	async fn get_public_setting(&self) -> Result<PublicSetting, BackendError> {
		Ok(PublicSetting {
			gpt_model: "gpt-test".to_string(),
			..PublicSetting::default()
		})
	}

	async fn upload_command(&self, record: &CommandRecord) -> Result<(), BackendError> {
		self.commands.lock().push(record.clone());
		Ok(())
	}

	async fn upload_replay(&self, session_id: &str, path: &Path) -> Result<(), BackendError> {
		self.replays.lock().push((session_id.to_string(), path.to_path_buf()));
		Ok(())
	}
}

/// One scripted reply of the completion fake.
pub(crate) enum Script {
	Items(Vec<Result<String, BackendError>>),
	Channel(mpsc::UnboundedReceiver<Result<String, BackendError>>),
	OpenError(BackendError),
}

impl Script {
	pub fn deltas(parts: &[&str]) -> Self {
		Script::Items(parts.iter().map(|p| Ok(p.to_string())).collect())
	}
}

/// Pops one script per call; an empty queue streams nothing.
#[derive(Default)]
pub(crate) struct FakeCompletion {
	scripts: Mutex<VecDeque<Script>>,
	calls: AtomicUsize,
	pub requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeCompletion {
	pub fn with(scripts: impl IntoIterator<Item = Script>) -> Self {
		Self {
			scripts: Mutex::new(scripts.into_iter().collect()),
			..Self::default()
		}
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub fn requests(&self) -> Vec<CompletionRequest> {
		self.requests.lock().clone()
	}
}

#[async_trait]
impl CompletionBackend for FakeCompletion {
	async fn stream_chat(&self, _params: &ConnectionParams, req: CompletionRequest) -> Result<DeltaStream, BackendError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.requests.lock().push(req);

		let script = self.scripts.lock().pop_front();
		match script {
			None => Ok(Box::pin(stream::empty())),
			Some(Script::Items(items)) => Ok(Box::pin(stream::iter(items))),
			Some(Script::Channel(rx)) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
				rx.recv().await.map(|item| (item, rx))
			}))),
			Some(Script::OpenError(e)) => Err(e),
		}
	}
}

pub(crate) fn temp_replay_dir() -> PathBuf {
	std::env::temp_dir().join(format!("chatgate-test-{}", uuid::Uuid::new_v4()))
}

pub(crate) fn test_settings() -> SessionSettings {
	SessionSettings {
		watchdog_poll: Duration::from_secs(3),
		close_grace: Duration::from_millis(10),
		replay_dir: temp_replay_dir(),
		..SessionSettings::default()
	}
}

pub(crate) fn test_state(auth: Arc<FakeAuth>, completion: Arc<FakeCompletion>) -> Arc<GatewayState> {
	Arc::new(GatewayState::new(
		auth,
		completion,
		Arc::new(AuditService::disabled()),
		test_settings(),
	))
}

/// Auth info with the given budgets and rules.
pub(crate) fn auth_info(idle_minutes: u32, max_hours: u32, rules: Vec<CommandAcl>) -> TokenAuthInfo {
	let mut settings = std::collections::HashMap::new();
	settings.insert("api_mode".to_string(), "gpt-test".to_string());

	TokenAuthInfo {
		key_id: "key-1".to_string(),
		user: User {
			id: "u1".to_string(),
			name: "Alice".to_string(),
			username: "alice".to_string(),
		},
		account: Account {
			id: "a1".to_string(),
			name: "openai".to_string(),
			username: "svc".to_string(),
			secret: chatgate_backend::SecretString::new("sk-test"),
		},
		asset: Asset {
			id: "as1".to_string(),
			name: "chat".to_string(),
			org_id: "org1".to_string(),
			address: "http://127.0.0.1:9".to_string(),
			protocols: vec![Protocol {
				name: "chatgpt".to_string(),
				port: 443,
			}],
			specific: AssetSpecific::default(),
		},
		platform: chatgate_backend::auth::Platform {
			id: 1,
			name: "ChatGPT".to_string(),
			protocols: vec![PlatformProtocol {
				name: "chatgpt".to_string(),
				settings,
			}],
		},
		setting: SessionSetting {
			max_idle_time: idle_minutes,
			max_session_time: max_hours,
		},
		filter_rules: rules,
		..TokenAuthInfo::default()
	}
}

/// Wait (bounded) until `cond` holds, yielding to background tasks.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
	for _ in 0..200 {
		if cond() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	cond()
}
