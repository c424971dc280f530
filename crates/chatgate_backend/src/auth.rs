#![forbid(unsafe_code)]

//! Authorization, session and audit backend.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chatgate_domain::{CommandAcl, RiskLevel};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::transport::{TransportOptions, build_client};
use crate::{BackendError, SecretString};

const CHECK_COOKIES_PATH: &str = "/api/v1/auth/cookies/check/";
const TOKEN_AUTH_INFO_PATH: &str = "/api/v1/auth/tokens/";
const SESSIONS_PATH: &str = "/api/v1/sessions/";
const PUBLIC_SETTING_PATH: &str = "/api/v1/settings/public/";
const COMMANDS_PATH: &str = "/api/v1/commands/";

/// Login source recorded on every session this gateway creates.
pub const LOGIN_FROM_WEB: &str = "WT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
	pub name: String,
	pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
	pub id: String,
	pub name: String,
	pub username: String,
}

impl User {
	/// `name(username)` display form.
	pub fn display(&self) -> String {
		format!("{}({})", self.name, self.username)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Account {
	pub id: String,
	pub name: String,
	pub username: String,
	pub secret: SecretString,
}

impl Account {
	pub fn display(&self) -> String {
		format!("{}({})", self.name, self.username)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Protocol {
	pub name: String,
	pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct AssetSpecific {
	pub http_proxy: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Asset {
	pub id: String,
	pub name: String,
	pub org_id: String,
	/// Completion endpoint base URL.
	pub address: String,
	pub protocols: Vec<Protocol>,
	pub specific: AssetSpecific,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct PlatformProtocol {
	pub name: String,
	pub settings: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Platform {
	pub id: i64,
	pub name: String,
	pub protocols: Vec<PlatformProtocol>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ExpireInfo {
	/// Unix seconds.
	pub expire_at: i64,
}

/// Per-session lifetime budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct SessionSetting {
	/// Minutes.
	pub max_idle_time: u32,
	/// Hours.
	pub max_session_time: u32,
}

/// Everything the gateway needs to open an interactive session.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenAuthInfo {
	pub key_id: String,
	pub user: User,
	pub account: Account,
	pub asset: Asset,
	pub platform: Platform,
	pub expire_info: ExpireInfo,
	pub setting: SessionSetting,
	pub filter_rules: Vec<CommandAcl>,
}

impl TokenAuthInfo {
	/// Model id configured on the platform's first protocol.
	pub fn model(&self) -> Option<&str> {
		self.platform
			.protocols
			.first()
			.and_then(|p| p.settings.get("api_mode"))
			.map(String::as_str)
	}

	pub fn protocol_name(&self) -> &str {
		self.asset.protocols.first().map(|p| p.name.as_str()).unwrap_or("chatgpt")
	}

	pub fn proxy(&self) -> Option<&str> {
		let p = self.asset.specific.http_proxy.trim();
		(!p.is_empty()).then_some(p)
	}
}

/// Session creation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionCreate {
	pub user_id: String,
	pub user: String,
	pub account_id: String,
	pub account: String,
	pub org_id: String,
	pub asset_id: String,
	pub asset: String,
	pub login_from: String,
	pub protocol: String,
	/// Unix seconds.
	pub date_start: i64,
	pub remote_addr: String,
}

impl SessionCreate {
	pub fn from_auth_info(info: &TokenAuthInfo, remote_addr: impl Into<String>, date_start: i64) -> Self {
		Self {
			user_id: info.user.id.clone(),
			user: info.user.display(),
			account_id: info.account.id.clone(),
			account: info.account.display(),
			org_id: info.asset.org_id.clone(),
			asset_id: info.asset.id.clone(),
			asset: info.asset.name.clone(),
			login_from: LOGIN_FROM_WEB.to_string(),
			protocol: info.protocol_name().to_string(),
			date_start,
			remote_addr: remote_addr.into(),
		}
	}
}

/// Session record as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct SessionRecord {
	pub id: String,
	pub user: String,
	pub account: String,
	pub asset: String,
	pub org_id: String,
}

/// Completion settings for anonymous (system) sessions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PublicSetting {
	pub gpt_api_key: SecretString,
	pub gpt_base_url: String,
	pub gpt_proxy: String,
	pub gpt_model: String,
}

/// One audited turn, as uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandRecord {
	pub sid: String,
	pub org_id: String,
	pub asset: String,
	pub account: String,
	pub user: String,
	/// Unix seconds.
	pub timestamp: i64,
	pub input: String,
	pub output: String,
	pub risk_level: RiskLevel,
	pub cmd_acl_id: String,
	pub cmd_group_id: String,
}

#[async_trait]
pub trait AuthBackend: Send + Sync + 'static {
	async fn check_user_by_cookies(&self, cookies: &[Cookie]) -> Result<User, BackendError>;

	async fn get_token_auth_info(&self, token: &str) -> Result<TokenAuthInfo, BackendError>;

	async fn create_session(&self, req: &SessionCreate) -> Result<SessionRecord, BackendError>;

	/// `date_end` is unix seconds.
	async fn finish_session(&self, session_id: &str, date_end: i64) -> Result<(), BackendError>;

	async fn get_public_setting(&self) -> Result<PublicSetting, BackendError>;

	async fn upload_command(&self, record: &CommandRecord) -> Result<(), BackendError>;

	async fn upload_replay(&self, session_id: &str, path: &Path) -> Result<(), BackendError>;
}

#[derive(Debug, Deserialize)]
struct Status {
	ok: bool,
	#[serde(default)]
	err: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
	status: Status,
	#[serde(default = "Option::default")]
	data: Option<T>,
}

impl<T> Envelope<T> {
	fn into_data(self, call: &'static str) -> Result<T, BackendError> {
		self.check(call)?;
		self.data.ok_or(BackendError::Rejected {
			call,
			detail: "missing data".to_string(),
		})
	}

	fn check(&self, call: &'static str) -> Result<(), BackendError> {
		if self.status.ok {
			Ok(())
		} else {
			Err(BackendError::Rejected {
				call,
				detail: self.status.err.clone(),
			})
		}
	}
}

#[derive(Debug, Serialize)]
struct CookiesRequest<'a> {
	cookies: &'a [Cookie],
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
	token: &'a str,
}

#[derive(Debug, Serialize)]
struct SessionCreateRequest<'a> {
	data: &'a SessionCreate,
}

#[derive(Debug, Serialize)]
struct SessionFinishRequest<'a> {
	id: &'a str,
	date_end: i64,
}

/// `AuthBackend` over HTTP/JSON with `{status, data}` envelopes.
#[derive(Debug, Clone)]
pub struct HttpAuthBackend {
	http: reqwest::Client,
	base_url: Url,
	access_key: SecretString,
}

impl HttpAuthBackend {
	pub fn new(base_url: &str, access_key: SecretString, timeout: Duration) -> Result<Self, BackendError> {
		let http = build_client(&TransportOptions {
			proxy: None,
			accept_invalid_certs: false,
			connect_timeout: Some(Duration::from_secs(5)),
			timeout: Some(timeout),
		})?;

		Ok(Self {
			http,
			base_url: Url::parse(base_url)?,
			access_key,
		})
	}

	fn url(&self, path: &str) -> Result<Url, BackendError> {
		Ok(self.base_url.join(path)?)
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		if self.access_key.is_empty() {
			req
		} else {
			req.bearer_auth(self.access_key.expose())
		}
	}

	async fn call<T: DeserializeOwned>(
		&self,
		req: reqwest::RequestBuilder,
		call: &'static str,
	) -> Result<Envelope<T>, BackendError> {
		let result = self.call_inner(req, call).await;
		let outcome = if result.is_ok() { "ok" } else { "error" };
		metrics::counter!("chatgate_backend_requests_total", "call" => call, "outcome" => outcome).increment(1);
		result
	}

	async fn call_inner<T: DeserializeOwned>(
		&self,
		req: reqwest::RequestBuilder,
		call: &'static str,
	) -> Result<Envelope<T>, BackendError> {
		let resp = self.authed(req).send().await?;
		let status = resp.status();
		let body = resp.text().await?;

		if !status.is_success() {
			return Err(BackendError::Status {
				call,
				status: status.as_u16(),
				body,
			});
		}

		Ok(serde_json::from_str(&body)?)
	}
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
	async fn check_user_by_cookies(&self, cookies: &[Cookie]) -> Result<User, BackendError> {
		let req = self.http.post(self.url(CHECK_COOKIES_PATH)?).json(&CookiesRequest { cookies });
		self.call::<User>(req, "check_user_by_cookies").await?.into_data("check_user_by_cookies")
	}

	async fn get_token_auth_info(&self, token: &str) -> Result<TokenAuthInfo, BackendError> {
		let req = self.http.post(self.url(TOKEN_AUTH_INFO_PATH)?).json(&TokenRequest { token });
		self.call::<TokenAuthInfo>(req, "get_token_auth_info")
			.await?
			.into_data("get_token_auth_info")
	}

	async fn create_session(&self, data: &SessionCreate) -> Result<SessionRecord, BackendError> {
		let req = self.http.post(self.url(SESSIONS_PATH)?).json(&SessionCreateRequest { data });
		let record = self
			.call::<SessionRecord>(req, "create_session")
			.await?
			.into_data("create_session")?;

		if record.id.trim().is_empty() {
			return Err(BackendError::Rejected {
				call: "create_session",
				detail: "empty session id".to_string(),
			});
		}
		Ok(record)
	}

	async fn finish_session(&self, session_id: &str, date_end: i64) -> Result<(), BackendError> {
		let url = self.url(&format!("{SESSIONS_PATH}{session_id}/finish/"))?;
		let req = self.http.post(url).json(&SessionFinishRequest {
			id: session_id,
			date_end,
		});
		self.call::<serde::de::IgnoredAny>(req, "finish_session")
			.await?
			.check("finish_session")
	}

	async fn get_public_setting(&self) -> Result<PublicSetting, BackendError> {
		let req = self.http.get(self.url(PUBLIC_SETTING_PATH)?);
		self.call::<PublicSetting>(req, "get_public_setting")
			.await?
			.into_data("get_public_setting")
	}

	async fn upload_command(&self, record: &CommandRecord) -> Result<(), BackendError> {
		let req = self.http.post(self.url(COMMANDS_PATH)?).json(record);
		self.call::<serde::de::IgnoredAny>(req, "upload_command")
			.await?
			.check("upload_command")
	}

	async fn upload_replay(&self, session_id: &str, path: &Path) -> Result<(), BackendError> {
		let bytes = tokio::fs::read(path).await?;
		let filename = path
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| format!("{session_id}.cast"));

		let mut url = self.url(&format!("{SESSIONS_PATH}{session_id}/replay/"))?;
		url.query_pairs_mut().append_pair("filename", &filename);

		let req = self
			.http
			.post(url)
			.header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
			.body(bytes);
		self.call::<serde::de::IgnoredAny>(req, "upload_replay")
			.await?
			.check("upload_replay")
	}
}
