#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chatgate_backend::{AuthBackend, CompletionBackend};
use chatgate_protocol::DEFAULT_MAX_FRAME_SIZE;

use crate::config::ServerSettings;
use crate::server::audit::AuditService;
use crate::server::registry::SessionRegistry;
use crate::server::relay::DEFAULT_SYSTEM_PROMPT;

/// Per-session tunables derived from the server config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub watchdog_poll: Duration,
	/// Pause between cancelling a session and tearing it down.
	pub close_grace: Duration,
	pub replay_dir: PathBuf,
	pub default_system_prompt: String,
	pub max_frame_size: usize,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			watchdog_poll: Duration::from_secs(3),
			close_grace: Duration::from_secs(1),
			replay_dir: PathBuf::from("data").join("replays"),
			default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

impl SessionSettings {
	pub fn from_server(cfg: &ServerSettings) -> Self {
		Self {
			watchdog_poll: cfg.watchdog_poll,
			close_grace: cfg.close_grace,
			replay_dir: cfg.replay_dir.clone(),
			default_system_prompt: cfg
				.default_system_prompt
				.clone()
				.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Shared gateway state, one per process.
pub struct GatewayState {
	pub registry: SessionRegistry,
	pub auth: Arc<dyn AuthBackend>,
	pub completion: Arc<dyn CompletionBackend>,
	pub audit: Arc<AuditService>,
	pub settings: SessionSettings,
}

impl GatewayState {
	pub fn new(
		auth: Arc<dyn AuthBackend>,
		completion: Arc<dyn CompletionBackend>,
		audit: Arc<AuditService>,
		settings: SessionSettings,
	) -> Self {
		Self {
			registry: SessionRegistry::new(),
			auth,
			completion,
			audit,
			settings,
		}
	}

	/// The client's prompt when non-blank, otherwise the configured default.
	pub fn system_prompt(&self, requested: &str) -> String {
		if requested.trim().is_empty() {
			self.settings.default_system_prompt.clone()
		} else {
			requested.to_string()
		}
	}
}
