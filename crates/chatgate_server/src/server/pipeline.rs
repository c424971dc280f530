#![forbid(unsafe_code)]

//! ACL gate and turn recording around one relay invocation.

use std::future::Future;
use std::sync::Arc;

use chatgate_backend::AuthBackend;
use chatgate_backend::auth::CommandRecord;
use chatgate_domain::{AclSet, AclVerdict, TurnRecord};
use chatgate_util::text::truncate_chars;
use tracing::{info, warn};

use crate::server::audit::AuditService;
use crate::server::replay::ReplayRecorder;
use crate::util::time::unix_secs_now;

/// Identity fields copied onto every uploaded turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandContext {
	pub org_id: String,
	pub asset: String,
	pub account: String,
	pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
	/// The thunk never ran.
	Blocked(AclVerdict),
	Forwarded(String),
}

pub struct AuditPipeline {
	session_id: String,
	acls: AclSet,
	transcript: ReplayRecorder,
	context: CommandContext,
	auth: Arc<dyn AuthBackend>,
	mirror: Arc<AuditService>,
}

impl AuditPipeline {
	pub fn new(
		session_id: impl Into<String>,
		acls: AclSet,
		transcript: ReplayRecorder,
		context: CommandContext,
		auth: Arc<dyn AuthBackend>,
		mirror: Arc<AuditService>,
	) -> Self {
		Self {
			session_id: session_id.into(),
			acls,
			transcript,
			context,
			auth,
			mirror,
		}
	}

	pub fn rule_count(&self) -> usize {
		self.acls.len()
	}

	pub fn transcript(&self) -> &ReplayRecorder {
		&self.transcript
	}

	/// Gate `input`, run `thunk` when allowed, and record the turn either way.
	pub async fn with_audit<F, Fut>(&self, input: &str, thunk: F) -> AuditOutcome
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = String>,
	{
		let verdict = self.acls.evaluate(input);
		self.transcript.write_input(input);

		let mut record = TurnRecord::new(input, &verdict);
		if !verdict.allowed {
			metrics::counter!("chatgate_server_acl_blocks_total").increment(1);
			info!(
				session_id = %self.session_id,
				acl_id = verdict.acl_id.as_deref().unwrap_or_default(),
				group_id = verdict.group_id.as_deref().unwrap_or_default(),
				input = %truncate_chars(input, 64),
				"turn blocked by command acl"
			);
			self.persist(record);
			return AuditOutcome::Blocked(verdict);
		}

		let output = thunk().await;
		self.transcript.write_output(&output);

		record.output.clone_from(&output);
		self.persist(record);
		AuditOutcome::Forwarded(output)
	}

	/// Fire-and-forget upload plus optional local mirror.
	fn persist(&self, record: TurnRecord) {
		let command = CommandRecord {
			sid: self.session_id.clone(),
			org_id: self.context.org_id.clone(),
			asset: self.context.asset.clone(),
			account: self.context.account.clone(),
			user: self.context.user.clone(),
			timestamp: unix_secs_now(),
			input: record.input.clone(),
			output: record.output.clone(),
			risk_level: record.risk_level,
			cmd_acl_id: record.acl_id.clone().unwrap_or_default(),
			cmd_group_id: record.group_id.clone().unwrap_or_default(),
		};

		let session_id = self.session_id.clone();
		let auth = Arc::clone(&self.auth);
		let mirror = Arc::clone(&self.mirror);
		tokio::spawn(async move {
			if let Err(e) = auth.upload_command(&command).await {
				metrics::counter!("chatgate_server_background_failures_total", "kind" => "upload_command").increment(1);
				warn!(session_id = %session_id, error = %e, "failed to upload turn record");
			}

			if let Err(e) = mirror.record_turn(&session_id, &record).await {
				metrics::counter!("chatgate_server_background_failures_total", "kind" => "audit_mirror").increment(1);
				warn!(session_id = %session_id, error = %e, "failed to mirror turn record");
			}
		});
	}
}
