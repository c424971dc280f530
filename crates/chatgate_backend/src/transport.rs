#![forbid(unsafe_code)]

use std::time::Duration;

use crate::BackendError;

const USER_AGENT: &str = concat!("chatgate/", env!("CARGO_PKG_VERSION"));

/// Outbound HTTP client settings.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
	/// Forward proxy for every scheme; empty means direct.
	pub proxy: Option<String>,
	/// Skip TLS certificate validation.
	pub accept_invalid_certs: bool,
	pub connect_timeout: Option<Duration>,
	/// Whole-request timeout. Leave unset for streaming calls.
	pub timeout: Option<Duration>,
}

impl TransportOptions {
	/// Settings used for completion endpoints: optional proxy, no certificate validation.
	pub fn completion(proxy: Option<&str>) -> Self {
		Self {
			proxy: proxy.map(str::trim).filter(|p| !p.is_empty()).map(str::to_string),
			accept_invalid_certs: true,
			connect_timeout: Some(Duration::from_secs(10)),
			timeout: None,
		}
	}
}

/// Build a `reqwest::Client`. An unparseable proxy is logged and ignored.
pub fn build_client(opts: &TransportOptions) -> Result<reqwest::Client, BackendError> {
	let mut builder = reqwest::Client::builder()
		.user_agent(USER_AGENT)
		.danger_accept_invalid_certs(opts.accept_invalid_certs);

	if let Some(proxy) = opts.proxy.as_deref() {
		match reqwest::Proxy::all(proxy) {
			Ok(p) => builder = builder.proxy(p),
			Err(e) => tracing::warn!(error = %e, "invalid proxy url; connecting directly"),
		}
	}

	if let Some(t) = opts.connect_timeout {
		builder = builder.connect_timeout(t);
	}
	if let Some(t) = opts.timeout {
		builder = builder.timeout(t);
	}

	Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn completion_options_drop_blank_proxy() {
		assert!(TransportOptions::completion(Some("  ")).proxy.is_none());
		assert!(TransportOptions::completion(None).accept_invalid_certs);
		assert_eq!(
			TransportOptions::completion(Some("http://proxy:3128")).proxy.as_deref(),
			Some("http://proxy:3128")
		);
	}

	#[test]
	fn invalid_proxy_still_builds() {
		let opts = TransportOptions {
			proxy: Some("::not a url::".to_string()),
			..TransportOptions::default()
		};
		assert!(build_client(&opts).is_ok());
	}
}
