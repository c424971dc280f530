#![forbid(unsafe_code)]

use std::sync::Arc;

use chatgate_backend::auth::PublicSetting;
use chatgate_domain::SessionKind;

use crate::server::fakes::{FakeAuth, FakeCompletion, auth_info, test_state};
use crate::server::outbound::Outbound;
use crate::server::registry::LookupError;
use crate::server::session::{InteractiveSession, SessionHandle, SystemSession};

#[tokio::test]
async fn unregistered_session_is_gone_for_both_kinds() {
	let state = test_state(Arc::new(FakeAuth::default()), Arc::new(FakeCompletion::default()));
	let (out, _rx) = Outbound::channel(1);

	let session = SystemSession::activate(&state, &PublicSetting::default(), "", out);
	let id = session.core().id().clone();

	assert!(state.registry.lookup_system(id.as_str()).is_ok());
	assert!(state.registry.unregister(&id));
	assert!(!state.registry.unregister(&id), "second unregister is a no-op");

	assert_eq!(
		state.registry.lookup_system(id.as_str()).err(),
		Some(LookupError::NotFound(id.to_string()))
	);
	assert_eq!(
		state.registry.lookup_interactive(id.as_str()).err(),
		Some(LookupError::NotFound(id.to_string()))
	);
	assert!(state.registry.is_empty());
}

#[tokio::test]
async fn lookup_of_the_other_kind_is_a_mismatch() {
	let auth = Arc::new(FakeAuth::new(auth_info(0, 0, Vec::new())));
	let state = test_state(Arc::clone(&auth), Arc::new(FakeCompletion::default()));
	let (out, _rx) = Outbound::channel(1);

	let info = auth.auth_info.clone();
	let interactive = InteractiveSession::activate(&state, &info, "127.0.0.1", "", out.clone())
		.await
		.unwrap();
	let system = SystemSession::activate(&state, &PublicSetting::default(), "", out);

	let iid = interactive.core().id().as_str().to_string();
	let sid = system.core().id().as_str().to_string();
	assert_ne!(iid, sid);

	assert!(matches!(
		state.registry.lookup_system(&iid),
		Err(LookupError::KindMismatch {
			expected: SessionKind::System,
			actual: SessionKind::Interactive,
			..
		})
	));
	assert!(matches!(
		state.registry.lookup_interactive(&sid),
		Err(LookupError::KindMismatch { .. })
	));

	let handle = state.registry.lookup_kind(&iid, SessionKind::Interactive).unwrap();
	assert_eq!(handle.kind(), SessionKind::Interactive);
	assert!(state.registry.lookup_kind(&sid, SessionKind::Interactive).is_err());
	assert!(state.registry.lookup("").is_none());
}

#[tokio::test]
async fn register_overwrites_same_id() {
	let state = test_state(Arc::new(FakeAuth::default()), Arc::new(FakeCompletion::default()));
	let (out, _rx) = Outbound::channel(1);

	let session = SystemSession::activate(&state, &PublicSetting::default(), "", out);
	let id = state.registry.register(SessionHandle::System(Arc::clone(&session)));

	assert_eq!(&id, session.core().id());
	assert_eq!(state.registry.len(), 1);
	assert_eq!(state.registry.ids(), vec![id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_register_and_unregister() {
	let state = test_state(Arc::new(FakeAuth::default()), Arc::new(FakeCompletion::default()));

	let mut tasks = Vec::new();
	for i in 0..64u64 {
		let state = Arc::clone(&state);
		tasks.push(tokio::spawn(async move {
			let (out, _rx) = Outbound::channel(i);
			let session = SystemSession::activate(&state, &PublicSetting::default(), "", out);
			let id = session.core().id().clone();
			assert!(state.registry.lookup_system(id.as_str()).is_ok());
			if i % 2 == 0 {
				state.registry.unregister(&id);
			}
		}));
	}

	for t in tasks {
		t.await.unwrap();
	}

	assert_eq!(state.registry.len(), 32);
	assert_eq!(state.registry.handles().len(), 32);
}
