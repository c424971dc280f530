#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chatgate_domain::{AclAction, AclSet, CommandAcl, CommandGroup, RiskLevel};

use crate::server::audit::AuditService;
use crate::server::fakes::{FakeAuth, eventually, temp_replay_dir};
use crate::server::pipeline::{AuditOutcome, AuditPipeline, CommandContext};
use crate::server::replay::ReplayRecorder;

fn rule(id: &str, action: AclAction, pattern: &str) -> CommandAcl {
	CommandAcl {
		id: id.to_string(),
		name: format!("rule-{id}"),
		priority: 50,
		action,
		is_active: true,
		command_groups: vec![CommandGroup {
			id: format!("group-{id}"),
			name: "words".to_string(),
			pattern: pattern.to_string(),
			ignore_case: true,
			..CommandGroup::default()
		}],
	}
}

fn pipeline(rules: &[CommandAcl], auth: &Arc<FakeAuth>, mirror: Arc<AuditService>) -> AuditPipeline {
	let (acls, errors) = AclSet::compile(rules);
	assert!(errors.is_empty());

	AuditPipeline::new(
		"s-1",
		acls,
		ReplayRecorder::spawn(&temp_replay_dir(), "s-1"),
		CommandContext {
			org_id: "org1".to_string(),
			asset: "chat".to_string(),
			account: "svc".to_string(),
			user: "alice".to_string(),
		},
		Arc::clone(auth) as Arc<dyn chatgate_backend::AuthBackend>,
		mirror,
	)
}

async fn transcript_rows(p: &AuditPipeline) -> Vec<String> {
	p.transcript().flush().await.unwrap();
	let text = tokio::fs::read_to_string(p.transcript().path()).await.unwrap_or_default();
	text.lines()
		.skip(1)
		.map(|l| {
			let (_, _, row): (f64, String, String) = serde_json::from_str(l).unwrap();
			row
		})
		.collect()
}

#[tokio::test]
async fn blocked_input_never_reaches_the_thunk() {
	let auth = Arc::new(FakeAuth::default());
	let p = pipeline(&[rule("r1", AclAction::Reject, "X")], &auth, Arc::new(AuditService::disabled()));

	let ran = AtomicBool::new(false);
	let outcome = p
		.with_audit("X", || async {
			ran.store(true, Ordering::SeqCst);
			"should not happen".to_string()
		})
		.await;

	let AuditOutcome::Blocked(verdict) = outcome else {
		panic!("expected block");
	};
	assert!(!ran.load(Ordering::SeqCst));
	assert_eq!(verdict.acl_name.as_deref(), Some("rule-r1"));

	let rows = transcript_rows(&p).await;
	assert_eq!(rows.len(), 1, "only the input row is written");
	assert!(rows[0].contains("]#: X"));

	assert!(eventually(|| auth.commands().len() == 1).await);
	let record = &auth.commands()[0];
	assert_eq!(record.input, "X");
	assert!(record.output.is_empty());
	assert_eq!(record.risk_level, RiskLevel::Reject);
	assert_eq!(record.cmd_acl_id, "r1");
	assert_eq!(record.cmd_group_id, "group-r1");
	assert_eq!(record.sid, "s-1");
}

#[tokio::test]
async fn allowed_input_records_output() {
	let auth = Arc::new(FakeAuth::default());
	let p = pipeline(&[rule("r1", AclAction::Reject, "forbidden")], &auth, Arc::new(AuditService::disabled()));

	let outcome = p.with_audit("hello there", || async { "general kenobi".to_string() }).await;
	assert_eq!(outcome, AuditOutcome::Forwarded("general kenobi".to_string()));

	let rows = transcript_rows(&p).await;
	assert_eq!(rows.len(), 2);
	assert!(rows[0].contains("]#: hello there"));
	assert!(rows[1].contains("general kenobi"));

	assert!(eventually(|| auth.commands().len() == 1).await);
	let record = &auth.commands()[0];
	assert_eq!(record.output, "general kenobi");
	assert_eq!(record.risk_level, RiskLevel::Normal);
	assert!(record.cmd_acl_id.is_empty());
	assert_eq!(record.user, "alice");
}

#[tokio::test]
async fn warning_and_review_actions() {
	let auth = Arc::new(FakeAuth::default());
	let p = pipeline(
		&[rule("w", AclAction::Warning, "careful"), rule("rv", AclAction::Review, "audit me")],
		&auth,
		Arc::new(AuditService::disabled()),
	);

	let warned = p.with_audit("be CAREFUL", || async { "ok".to_string() }).await;
	assert_eq!(warned, AuditOutcome::Forwarded("ok".to_string()));

	let reviewed = p.with_audit("please audit me", || async { "no".to_string() }).await;
	assert!(matches!(reviewed, AuditOutcome::Blocked(_)));

	assert!(eventually(|| auth.commands().len() == 2).await);
	let mut levels: Vec<RiskLevel> = auth.commands().iter().map(|c| c.risk_level).collect();
	levels.sort_by_key(|l| l.as_str());
	assert_eq!(levels, [RiskLevel::Reject, RiskLevel::Warning]);
}

#[tokio::test]
async fn turns_are_mirrored_locally_when_enabled() {
	let auth = Arc::new(FakeAuth::default());
	let mirror = Arc::new(AuditService::connect("sqlite::memory:").await.unwrap());
	let p = pipeline(&[rule("r1", AclAction::Reject, "X")], &auth, Arc::clone(&mirror));

	p.with_audit("X", || async { String::new() }).await;
	p.with_audit("fine", || async { "answer".to_string() }).await;

	let mut rows = Vec::new();
	for _ in 0..200 {
		rows = mirror.turns_for("s-1").await.unwrap();
		if rows.len() == 2 {
			break;
		}
		tokio::time::sleep(std::time::Duration::from_millis(10)).await;
	}
	rows.sort();
	assert_eq!(
		rows,
		vec![
			("X".to_string(), String::new(), "reject".to_string()),
			("fine".to_string(), "answer".to_string(), "normal".to_string()),
		]
	);
}
