#![forbid(unsafe_code)]

//! One cancellable streaming exchange with the completion backend.

use chatgate_backend::completion::ChatTurn;
use chatgate_backend::{CompletionBackend, CompletionRequest, ConnectionParams};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Used when a session carries no system instruction of its own.
pub const DEFAULT_SYSTEM_PROMPT: &str = "Please do not provide information related to politics.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finish {
	Completed,
	Cancelled,
	Failed(String),
}

impl Finish {
	pub fn as_str(&self) -> &'static str {
		match self {
			Finish::Completed => "completed",
			Finish::Cancelled => "cancelled",
			Finish::Failed(_) => "failed",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
	/// Everything accumulated before the exchange ended.
	pub content: String,
	pub finish: Finish,
}

/// Emitted in order: zero or more `Answer`, then exactly one `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
	/// Full accumulated text so far.
	Answer(String),
	Done(RelayOutcome),
}

#[derive(Debug, Clone)]
pub struct RelayRequest {
	/// Prior user turns, oldest first, including the current one.
	pub history: Vec<String>,
	pub system_prompt: String,
	pub model: String,
	pub params: ConnectionParams,
}

impl RelayRequest {
	fn into_completion(self) -> (ConnectionParams, CompletionRequest) {
		let system = if self.system_prompt.trim().is_empty() {
			DEFAULT_SYSTEM_PROMPT.to_string()
		} else {
			self.system_prompt
		};

		let mut messages = Vec::with_capacity(self.history.len() + 1);
		messages.push(ChatTurn::system(system));
		messages.extend(self.history.into_iter().map(ChatTurn::user));

		(
			self.params,
			CompletionRequest {
				model: self.model,
				messages,
			},
		)
	}
}

enum Step<T> {
	Cancelled,
	Ready(T),
}

/// Run one exchange, publishing progress through `emit`.
pub async fn relay<F>(
	backend: &dyn CompletionBackend,
	req: RelayRequest,
	cancel: &CancellationToken,
	mut emit: F,
) -> RelayOutcome
where
	F: FnMut(RelayEvent),
{
	let mut buffer = String::new();
	let finish = stream_into(backend, req, cancel, &mut buffer, &mut emit).await;

	match &finish {
		Finish::Failed(reason) => warn!(reason = %reason, chars = buffer.len(), "completion stream failed"),
		other => debug!(finish = other.as_str(), chars = buffer.len(), "completion stream ended"),
	}
	metrics::counter!("chatgate_server_relay_outcomes_total", "finish" => finish.as_str()).increment(1);

	let outcome = RelayOutcome { content: buffer, finish };
	emit(RelayEvent::Done(outcome.clone()));
	outcome
}

async fn stream_into<F>(
	backend: &dyn CompletionBackend,
	req: RelayRequest,
	cancel: &CancellationToken,
	buffer: &mut String,
	emit: &mut F,
) -> Finish
where
	F: FnMut(RelayEvent),
{
	if cancel.is_cancelled() {
		return Finish::Cancelled;
	}

	let (params, completion) = req.into_completion();
	let opened = tokio::select! {
		biased;
		_ = cancel.cancelled() => Step::Cancelled,
		r = backend.stream_chat(&params, completion) => Step::Ready(r),
	};

	let mut stream = match opened {
		Step::Cancelled => return Finish::Cancelled,
		Step::Ready(Ok(s)) => s,
		Step::Ready(Err(e)) => return Finish::Failed(e.to_string()),
	};

	loop {
		let next = tokio::select! {
			biased;
			_ = cancel.cancelled() => Step::Cancelled,
			n = stream.next() => Step::Ready(n),
		};

		match next {
			Step::Cancelled => return Finish::Cancelled,
			Step::Ready(None) => return Finish::Completed,
			Step::Ready(Some(Err(e))) => return Finish::Failed(e.to_string()),
			Step::Ready(Some(Ok(delta))) => {
				if cancel.is_cancelled() {
					return Finish::Cancelled;
				}
				buffer.push_str(&delta);
				emit(RelayEvent::Answer(buffer.clone()));
			}
		}
	}
}
