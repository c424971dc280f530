#![forbid(unsafe_code)]

//! Command ACL rules and their evaluation against turn input.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RiskLevel;

/// Action attached to an ACL rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclAction {
	Reject,
	Accept,
	Review,
	Warning,
	#[default]
	#[serde(other)]
	Unknown,
}

impl AclAction {
	/// Whether a turn matching this action may be forwarded.
	pub const fn allows(self) -> bool {
		!matches!(self, AclAction::Reject | AclAction::Review)
	}

	pub const fn risk_level(self) -> RiskLevel {
		match self {
			AclAction::Reject | AclAction::Review => RiskLevel::Reject,
			AclAction::Warning => RiskLevel::Warning,
			AclAction::Accept | AclAction::Unknown => RiskLevel::Normal,
		}
	}
}

/// A named set of command patterns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandGroup {
	pub id: String,
	pub name: String,
	/// Newline separated command list (used when `pattern` is empty).
	pub content: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub pattern: String,
	pub ignore_case: bool,
}

/// One command ACL rule as delivered by the authorization backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandAcl {
	pub id: String,
	pub name: String,
	pub priority: i32,
	pub action: AclAction,
	pub is_active: bool,
	pub command_groups: Vec<CommandGroup>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AclError {
	#[error("invalid pattern in acl={acl_id} group={group_id}: {detail}")]
	InvalidPattern {
		acl_id: String,
		group_id: String,
		detail: String,
	},
}

/// Outcome of evaluating a rule list against one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclVerdict {
	pub allowed: bool,
	pub action: Option<AclAction>,
	pub risk_level: RiskLevel,
	pub acl_id: Option<String>,
	pub acl_name: Option<String>,
	pub group_id: Option<String>,
}

impl AclVerdict {
	/// Verdict used when no rule matches.
	pub fn default_allow() -> Self {
		Self {
			allowed: true,
			action: None,
			risk_level: RiskLevel::Normal,
			acl_id: None,
			acl_name: None,
			group_id: None,
		}
	}
}

#[derive(Debug, Clone)]
struct CompiledGroup {
	id: String,
	regex: Regex,
}

#[derive(Debug, Clone)]
struct CompiledAcl {
	id: String,
	name: String,
	action: AclAction,
	groups: Vec<CompiledGroup>,
}

/// Rule list compiled once per session; evaluation order is list order.
#[derive(Debug, Clone, Default)]
pub struct AclSet {
	rules: Vec<CompiledAcl>,
}

impl AclSet {
	/// Compile rules. Inactive rules are dropped, groups with invalid
	/// patterns are skipped and reported.
	pub fn compile(acls: &[CommandAcl]) -> (Self, Vec<AclError>) {
		let mut rules = Vec::with_capacity(acls.len());
		let mut errors = Vec::new();

		for acl in acls.iter().filter(|a| a.is_active) {
			let mut groups = Vec::with_capacity(acl.command_groups.len());
			for group in &acl.command_groups {
				let Some(source) = group_pattern(group) else {
					continue;
				};

				match RegexBuilder::new(&source).case_insensitive(group.ignore_case).build() {
					Ok(regex) => groups.push(CompiledGroup {
						id: group.id.clone(),
						regex,
					}),
					Err(e) => errors.push(AclError::InvalidPattern {
						acl_id: acl.id.clone(),
						group_id: group.id.clone(),
						detail: e.to_string(),
					}),
				}
			}

			rules.push(CompiledAcl {
				id: acl.id.clone(),
				name: acl.name.clone(),
				action: acl.action,
				groups,
			});
		}

		(Self { rules }, errors)
	}

	pub fn is_empty(&self) -> bool {
		self.rules.is_empty()
	}

	pub fn len(&self) -> usize {
		self.rules.len()
	}

	/// First matching rule decides; no match allows.
	pub fn evaluate(&self, input: &str) -> AclVerdict {
		for rule in &self.rules {
			if let Some(group) = rule.groups.iter().find(|g| g.regex.is_match(input)) {
				return AclVerdict {
					allowed: rule.action.allows(),
					action: Some(rule.action),
					risk_level: rule.action.risk_level(),
					acl_id: Some(rule.id.clone()),
					acl_name: Some(rule.name.clone()),
					group_id: Some(group.id.clone()),
				};
			}
		}

		AclVerdict::default_allow()
	}
}

/// Explicit pattern, or an alternation of the escaped command lines.
fn group_pattern(group: &CommandGroup) -> Option<String> {
	let pattern = group.pattern.trim();
	if !pattern.is_empty() {
		return Some(pattern.to_string());
	}

	let alternatives = group
		.content
		.lines()
		.map(str::trim)
		.filter(|l| !l.is_empty())
		.map(regex::escape)
		.collect::<Vec<_>>();

	if alternatives.is_empty() {
		return None;
	}

	Some(format!(r"\b(?:{})\b", alternatives.join("|")))
}
