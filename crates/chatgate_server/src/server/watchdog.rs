#![forbid(unsafe_code)]

//! Idle and absolute lifetime enforcement for interactive sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::server::session::{IdleCheck, InteractiveSession};

/// Session budgets as granted by the authorization backend. Zero disables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Budgets {
	pub idle_minutes: u32,
	pub max_hours: u32,
}

impl Budgets {
	pub fn idle(&self) -> Option<Duration> {
		(self.idle_minutes > 0).then(|| Duration::from_secs(u64::from(self.idle_minutes) * 60))
	}

	pub fn absolute(&self) -> Option<Duration> {
		(self.max_hours > 0).then(|| Duration::from_secs(u64::from(self.max_hours) * 60 * 60))
	}
}

pub fn idle_reason(minutes: u32) -> String {
	format!("session idle for more than {minutes} minutes, session closed")
}

pub fn absolute_reason(hours: u32) -> String {
	format!("session exceeded maximum duration of {hours} hours, session closed")
}

/// Start both watchdogs; each stops when the session token is cancelled.
pub(crate) fn spawn(session: &Arc<InteractiveSession>, poll: Duration) {
	let budgets = session.budgets();

	if let Some(budget) = budgets.idle() {
		tokio::spawn(run_idle(Arc::clone(session), budget, budgets.idle_minutes, poll));
	}

	if let Some(budget) = budgets.absolute() {
		tokio::spawn(run_absolute(Arc::clone(session), budget, budgets.max_hours, poll));
	}
}

async fn run_idle(session: Arc<InteractiveSession>, budget: Duration, minutes: u32, poll: Duration) {
	let cancel = session.core().cancel_token().clone();
	let mut ticker = tokio::time::interval(poll);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				debug!(session_id = %session.core().id(), "idle watchdog stopped");
				return;
			}
			_ = ticker.tick() => {}
		}

		if session.core().poll_idle(budget) == IdleCheck::Expired {
			info!(session_id = %session.core().id(), minutes, "idle budget exhausted");
			metrics::counter!("chatgate_server_watchdog_expiries_total", "kind" => "idle").increment(1);
			session.close(&idle_reason(minutes)).await;
			return;
		}
	}
}

async fn run_absolute(session: Arc<InteractiveSession>, budget: Duration, hours: u32, poll: Duration) {
	let cancel = session.core().cancel_token().clone();
	let started = Instant::now();
	let mut ticker = tokio::time::interval(poll);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				debug!(session_id = %session.core().id(), "absolute watchdog stopped");
				return;
			}
			_ = ticker.tick() => {}
		}

		if started.elapsed() >= budget {
			info!(session_id = %session.core().id(), hours, "session lifetime exhausted");
			metrics::counter!("chatgate_server_watchdog_expiries_total", "kind" => "absolute").increment(1);
			session.close(&absolute_reason(hours)).await;
			return;
		}
	}
}
