#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use chatgate_backend::SecretString;
use http_body_util::{BodyExt as _, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{
	CONNECTION, CONTENT_TYPE, HeaderValue, LOCATION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION,
	UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::auth::{bearer_token, parse_cookie_header, verify_hmac_token};
use crate::server::connection::{Identity, handle_connection};
use crate::server::control;
use crate::server::state::GatewayState;

const MAX_CONTROL_BODY: usize = 64 * 1024;
/// RFC 6455 is the only version spoken.
const WEBSOCKET_VERSION: &str = "13";

type HttpResponse = Response<Full<Bytes>>;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
	/// Normalized prefix (`/chatgate`, or empty for root).
	pub base_path: String,
	pub login_url: String,
	pub auth_hmac_secret: Option<SecretString>,
}

/// Everything a request handler needs.
pub struct HttpContext {
	pub state: Arc<GatewayState>,
	pub health: HealthState,
	pub settings: HttpSettings,
	next_conn_id: AtomicU64,
}

impl HttpContext {
	pub fn new(state: Arc<GatewayState>, health: HealthState, settings: HttpSettings) -> Self {
		Self {
			state,
			health,
			settings,
			next_conn_id: AtomicU64::new(1),
		}
	}

	fn next_conn_id(&self) -> u64 {
		self.next_conn_id.fetch_add(1, Ordering::Relaxed)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
	Chat,
	SystemChat,
	Interrupt,
	ReviewState,
	Health,
	Healthz,
	Readyz,
	NotFound,
}

/// Map a request path to a route; a trailing slash is optional.
pub(crate) fn resolve_route(base_path: &str, path: &str) -> Route {
	match path {
		"/healthz" => return Route::Healthz,
		"/readyz" => return Route::Readyz,
		_ => {}
	}

	let Some(rest) = path.strip_prefix(base_path) else {
		return Route::NotFound;
	};

	match rest.trim_end_matches('/') {
		"/chat" => Route::Chat,
		"/chat/system" => Route::SystemChat,
		"/interrupt_current_ask" => Route::Interrupt,
		"/jms_state" => Route::ReviewState,
		"/health" => Route::Health,
		_ => Route::NotFound,
	}
}

/// Accept loop; stops taking new connections once `shutdown` fires.
pub async fn serve(listener: TcpListener, ctx: Arc<HttpContext>, shutdown: CancellationToken) -> anyhow::Result<()> {
	loop {
		let (stream, peer) = tokio::select! {
			biased;
			_ = shutdown.cancelled() => {
				info!("http listener stopped");
				return Ok(());
			}
			r = listener.accept() => r?,
		};

		let io = TokioIo::new(stream);
		let ctx = Arc::clone(&ctx);
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, Arc::clone(&ctx), peer));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
				debug!(error = %err, %peer, "http connection error");
			}
		});
	}
}

async fn handle_request(
	req: Request<Incoming>,
	ctx: Arc<HttpContext>,
	peer: SocketAddr,
) -> Result<HttpResponse, Infallible> {
	let route = resolve_route(&ctx.settings.base_path, req.uri().path());
	metrics::counter!("chatgate_server_http_requests_total").increment(1);

	let method = req.method().clone();
	let resp = match route {
		Route::Healthz if method == Method::GET => text(StatusCode::OK, "ok"),
		Route::Readyz if method == Method::GET => {
			if ctx.health.is_ready() {
				text(StatusCode::OK, "ready")
			} else {
				text(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}
		Route::Health if method == Method::GET => json_response(
			StatusCode::OK,
			&json!({ "status": true, "sessions": ctx.state.registry.len() }),
		),
		Route::Chat if method == Method::GET => chat_upgrade(req, &ctx, peer, false).await,
		Route::SystemChat if method == Method::GET => chat_upgrade(req, &ctx, peer, true).await,
		Route::Interrupt if method == Method::POST => control_request(req, &ctx, control::interrupt_current_ask).await,
		Route::ReviewState if method == Method::POST => control_request(req, &ctx, control::set_review_state).await,
		Route::NotFound => empty(StatusCode::NOT_FOUND),
		_ => empty(StatusCode::METHOD_NOT_ALLOWED),
	};

	Ok(resp)
}

async fn control_request(
	req: Request<Incoming>,
	ctx: &HttpContext,
	op: fn(&crate::server::registry::SessionRegistry, &[u8]) -> control::ControlReply,
) -> HttpResponse {
	let service_ok = ctx.settings.auth_hmac_secret.as_ref().is_some_and(|secret| {
		bearer_token(req.headers()).is_some_and(|token| match verify_hmac_token(token, secret.expose()) {
			Ok(claims) => {
				debug!(sub = %claims.sub, "control request authorized by service token");
				true
			}
			Err(e) => {
				warn!(error = %e, "service token rejected");
				false
			}
		})
	});

	if !service_ok && let Err(resp) = check_cookies(req.headers(), req.uri(), ctx).await {
		return resp;
	}

	let body = match Limited::new(req.into_body(), MAX_CONTROL_BODY).collect().await {
		Ok(b) => b.to_bytes(),
		Err(e) => {
			debug!(error = %e, "failed to read control body");
			return json_response(StatusCode::BAD_REQUEST, &json!({ "error": "Invalid data" }));
		}
	};

	let (status, value) = op(&ctx.state.registry, &body);
	json_response(status, &value)
}

async fn chat_upgrade(mut req: Request<Incoming>, ctx: &HttpContext, peer: SocketAddr, system: bool) -> HttpResponse {
	let Some(key) = websocket_key(&req) else {
		return json_response(StatusCode::BAD_REQUEST, &json!({ "error": "websocket upgrade required" }));
	};

	if !supported_websocket_version(req.headers()) {
		debug!(version = ?req.headers().get(SEC_WEBSOCKET_VERSION), "unsupported websocket version");
		let mut resp = empty(StatusCode::UPGRADE_REQUIRED);
		resp.headers_mut()
			.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static(WEBSOCKET_VERSION));
		return resp;
	}

	if let Err(resp) = check_cookies(req.headers(), req.uri(), ctx).await {
		return resp;
	}

	let state = &ctx.state;
	let identity = if system {
		match state.auth.get_public_setting().await {
			Ok(setting) => Identity::System {
				setting: Arc::new(setting),
			},
			Err(e) => {
				warn!(error = %e, "failed to fetch public setting");
				return json_response(StatusCode::BAD_REQUEST, &json!({ "error": e.to_string() }));
			}
		}
	} else {
		let Some(token) = query_param(&req, "token") else {
			return json_response(StatusCode::BAD_REQUEST, &json!({ "error": "token required" }));
		};
		match state.auth.get_token_auth_info(&token).await {
			Ok(info) => Identity::Interactive {
				auth_info: Arc::new(info),
				remote_addr: client_ip(&req, peer),
			},
			Err(e) => {
				warn!(error = %e, "token auth info rejected");
				return json_response(StatusCode::BAD_REQUEST, &json!({ "error": e.to_string() }));
			}
		}
	};

	let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
		return empty(StatusCode::INTERNAL_SERVER_ERROR);
	};

	let conn_id = ctx.next_conn_id();
	let on_upgrade = hyper::upgrade::on(&mut req);
	let state = Arc::clone(state);
	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
				if let Err(e) = handle_connection(conn_id, ws, identity, state).await {
					warn!(conn_id, error = %e, "connection handler exited with error");
				}
			}
			Err(e) => warn!(conn_id, error = %e, "websocket upgrade failed"),
		}
	});

	let mut resp = empty(StatusCode::SWITCHING_PROTOCOLS);
	let headers = resp.headers_mut();
	headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
	headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
	headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
	resp
}

/// Cookie credential check; failure becomes a login redirect.
async fn check_cookies(headers: &HeaderMap, uri: &Uri, ctx: &HttpContext) -> Result<(), HttpResponse> {
	let cookies = parse_cookie_header(headers);
	let result = if cookies.is_empty() {
		Err("no cookies".to_string())
	} else {
		ctx.state
			.auth
			.check_user_by_cookies(&cookies)
			.await
			.map(|user| debug!(user = %user.display(), "cookie check passed"))
			.map_err(|e| e.to_string())
	};

	result.map_err(|e| {
		warn!(error = %e, "check user cookie failed");
		let request_uri = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or_else(|| uri.path());
		login_redirect(&ctx.settings.login_url, request_uri)
	})
}

pub(crate) fn login_redirect(login_url: &str, request_uri: &str) -> HttpResponse {
	let next: String = url::form_urlencoded::byte_serialize(request_uri.as_bytes()).collect();
	let location = format!("{login_url}?next={next}");
	match HeaderValue::from_str(&location) {
		Ok(v) => {
			let mut resp = empty(StatusCode::FOUND);
			resp.headers_mut().insert(LOCATION, v);
			resp
		}
		Err(_) => empty(StatusCode::UNAUTHORIZED),
	}
}

fn websocket_key(req: &Request<Incoming>) -> Option<HeaderValue> {
	let upgrade = req.headers().get(UPGRADE)?.to_str().ok()?;
	if !upgrade.eq_ignore_ascii_case("websocket") {
		return None;
	}
	req.headers().get(SEC_WEBSOCKET_KEY).cloned()
}

fn supported_websocket_version(headers: &HeaderMap) -> bool {
	headers
		.get(SEC_WEBSOCKET_VERSION)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.trim() == WEBSOCKET_VERSION)
}

fn query_param(req: &Request<Incoming>, name: &str) -> Option<String> {
	let query = req.uri().query()?;
	url::form_urlencoded::parse(query.as_bytes())
		.find(|(k, _)| k == name)
		.map(|(_, v)| v.into_owned())
		.filter(|v| !v.is_empty())
}

/// First `X-Forwarded-For` hop, else the socket peer.
fn client_ip(req: &Request<Incoming>, peer: SocketAddr) -> String {
	req.headers()
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').next())
		.map(str::trim)
		.filter(|v| !v.is_empty())
		.map(str::to_string)
		.unwrap_or_else(|| peer.ip().to_string())
}

fn empty(status: StatusCode) -> HttpResponse {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}

fn text(status: StatusCode, body: &'static str) -> HttpResponse {
	let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*resp.status_mut() = status;
	resp
}

fn json_response(status: StatusCode, value: &Value) -> HttpResponse {
	let mut resp = Response::new(Full::new(Bytes::from(value.to_string())));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}
