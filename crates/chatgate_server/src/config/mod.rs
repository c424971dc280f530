#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatgate_backend::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_BASE_PATH: &str = "/chatgate";
pub const DEFAULT_LOGIN_URL: &str = "/core/auth/login/";
pub const DEFAULT_CORE_BASE_URL: &str = "http://127.0.0.1:8080";

/// Default config path: `~/.chatgate/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatgate").join("config.toml"))
}

/// Load the server config from TOML and `CHATGATE_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub core: CoreSettings,
	pub persistence: PersistenceSettings,
}

/// Listener and session settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listen endpoint (`http://host:port`); the CLI flag wins over this.
	pub bind: Option<String>,
	/// Route prefix, always starting with `/` and without a trailing slash.
	pub base_path: String,
	/// Redirect target for unauthenticated requests.
	pub login_url: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret accepted on control routes.
	pub auth_hmac_secret: Option<SecretString>,
	/// Directory for per-session transcript files.
	pub replay_dir: PathBuf,
	pub watchdog_poll: Duration,
	pub close_grace: Duration,
	/// Replaces the built-in system instruction when set.
	pub default_system_prompt: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: None,
			base_path: DEFAULT_BASE_PATH.to_string(),
			login_url: DEFAULT_LOGIN_URL.to_string(),
			metrics_bind: None,
			auth_hmac_secret: None,
			replay_dir: PathBuf::from("data").join("replays"),
			watchdog_poll: Duration::from_secs(3),
			close_grace: Duration::from_secs(1),
			default_system_prompt: None,
		}
	}
}

/// Authorization/session backend settings.
#[derive(Debug, Clone)]
pub struct CoreSettings {
	pub base_url: String,
	pub access_key: Option<SecretString>,
	pub request_timeout: Duration,
}

impl Default for CoreSettings {
	fn default() -> Self {
		Self {
			base_url: DEFAULT_CORE_BASE_URL.to_string(),
			access_key: None,
			request_timeout: Duration::from_secs(10),
		}
	}
}

/// Local turn mirror settings.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable persistence.
	pub enabled: bool,
	/// Database URL (sqlite:, postgres: or mysql:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	core: FileCoreSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	base_path: Option<String>,
	login_url: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	replay_dir: Option<String>,
	watchdog_poll_ms: Option<u64>,
	close_grace_ms: Option<u64>,
	default_system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCoreSettings {
	base_url: Option<String>,
	access_key: Option<String>,
	request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// `/x/`, `x` and `/x` all normalize to `/x`; empty stays empty (root).
pub fn normalize_base_path(raw: &str) -> String {
	let trimmed = raw.trim().trim_matches('/');
	if trimmed.is_empty() {
		String::new()
	} else {
		format!("/{trimmed}")
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let core_defaults = CoreSettings::default();

		Self {
			server: ServerSettings {
				bind: non_empty(file.server.bind),
				base_path: file
					.server
					.base_path
					.map(|p| normalize_base_path(&p))
					.unwrap_or(defaults.base_path),
				login_url: non_empty(file.server.login_url).unwrap_or(defaults.login_url),
				metrics_bind: non_empty(file.server.metrics_bind),
				auth_hmac_secret: non_empty(file.server.auth_hmac_secret).map(SecretString::new),
				replay_dir: non_empty(file.server.replay_dir)
					.map(PathBuf::from)
					.unwrap_or(defaults.replay_dir),
				watchdog_poll: file
					.server
					.watchdog_poll_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(defaults.watchdog_poll),
				close_grace: file
					.server
					.close_grace_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.close_grace),
				default_system_prompt: non_empty(file.server.default_system_prompt),
			},
			core: CoreSettings {
				base_url: non_empty(file.core.base_url).unwrap_or(core_defaults.base_url),
				access_key: non_empty(file.core.access_key).map(SecretString::new),
				request_timeout: file
					.core
					.request_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(core_defaults.request_timeout),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("CHATGATE_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = var("CHATGATE_BASE_PATH") {
		cfg.server.base_path = normalize_base_path(&v);
		info!(base_path = %cfg.server.base_path, "server config: base_path overridden by env");
	}

	if let Some(v) = var("CHATGATE_LOGIN_URL") {
		cfg.server.login_url = v;
		info!("server config: login_url overridden by env");
	}

	if let Some(v) = var("CHATGATE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("CHATGATE_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = var("CHATGATE_REPLAY_DIR") {
		cfg.server.replay_dir = PathBuf::from(v);
		info!("server config: replay_dir overridden by env");
	}

	if let Some(v) = var("CHATGATE_WATCHDOG_POLL_MS") {
		match v.parse::<u64>() {
			Ok(ms) if ms > 0 => {
				cfg.server.watchdog_poll = Duration::from_millis(ms);
				info!(ms, "server config: watchdog_poll overridden by env");
			}
			_ => warn!(value = %v, "server config: ignoring invalid CHATGATE_WATCHDOG_POLL_MS"),
		}
	}

	if let Some(v) = var("CHATGATE_CLOSE_GRACE_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.close_grace = Duration::from_millis(ms);
		info!(ms, "server config: close_grace overridden by env");
	}

	if let Some(v) = var("CHATGATE_SYSTEM_PROMPT") {
		cfg.server.default_system_prompt = Some(v);
		info!("server config: default_system_prompt overridden by env");
	}

	if let Some(v) = var("CHATGATE_CORE_BASE_URL") {
		cfg.core.base_url = v;
		info!("core config: base_url overridden by env");
	}

	if let Some(v) = var("CHATGATE_CORE_ACCESS_KEY") {
		cfg.core.access_key = Some(SecretString::new(v));
		info!("core config: access_key overridden by env");
	}

	if let Some(v) = var("CHATGATE_CORE_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.core.request_timeout = Duration::from_secs(secs);
		info!(secs, "core config: request_timeout overridden by env");
	}

	if let Some(v) = var("CHATGATE_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = var("CHATGATE_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.core.access_key.is_none() {
		warn!("core config: no access_key configured; backend calls are unauthenticated");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn from_toml(s: &str) -> ServerConfig {
		ServerConfig::from_file(toml::from_str(s).expect("toml"))
	}

	#[test]
	fn defaults_apply_without_file() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert_eq!(cfg.server.base_path, "/chatgate");
		assert_eq!(cfg.server.watchdog_poll, Duration::from_secs(3));
		assert_eq!(cfg.server.close_grace, Duration::from_secs(1));
		assert_eq!(cfg.core.base_url, DEFAULT_CORE_BASE_URL);
		assert!(!cfg.persistence.enabled);
	}

	#[test]
	fn file_values_are_read_and_trimmed() {
		let cfg = from_toml(
			r#"
			[server]
			base_path = "kael/"
			login_url = "  "
			watchdog_poll_ms = 500
			auth_hmac_secret = "s3cret"

			[core]
			base_url = "http://core:8080"
			access_key = "ak"
			request_timeout_secs = 0

			[persistence]
			enabled = true
			database_url = "sqlite::memory:"
			"#,
		);

		assert_eq!(cfg.server.base_path, "/kael");
		assert_eq!(cfg.server.login_url, DEFAULT_LOGIN_URL);
		assert_eq!(cfg.server.watchdog_poll, Duration::from_millis(500));
		assert_eq!(cfg.server.auth_hmac_secret.as_ref().map(|s| s.expose()), Some("s3cret"));
		assert_eq!(cfg.core.request_timeout, Duration::from_secs(10));
		assert!(cfg.persistence.enabled);
	}

	#[test]
	fn env_overrides_win() {
		let mut cfg = ServerConfig::default();
		let env: HashMap<&str, &str> = [
			("CHATGATE_BASE_PATH", "/"),
			("CHATGATE_CORE_ACCESS_KEY", "key"),
			("CHATGATE_PERSISTENCE_ENABLED", "yes"),
			("CHATGATE_WATCHDOG_POLL_MS", "0"),
			("CHATGATE_CLOSE_GRACE_MS", "0"),
		]
		.into_iter()
		.collect();

		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.server.base_path, "");
		assert_eq!(cfg.core.access_key.as_ref().map(|s| s.expose()), Some("key"));
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.server.watchdog_poll, Duration::from_secs(3));
		assert_eq!(cfg.server.close_grace, Duration::ZERO);
	}

	#[test]
	fn env_bool_parsing() {
		assert_eq!(parse_env_bool(" On "), Some(true));
		assert_eq!(parse_env_bool("0"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
