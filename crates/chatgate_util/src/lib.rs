#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `http://host:port` listen endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct BindEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl BindEndpoint {
		/// Returns `host:port` (IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Listeners only bind IP literals.
		pub fn to_socket_addr(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("bind host must be an IP literal: {}", self.host))
		}

		/// Parse `http://host:port`; a bare `host:port` is accepted too.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected http://host:port)".to_string());
			}

			let rest = s.strip_prefix("http://").unwrap_or(s);
			if rest.contains("://") {
				return Err(format!("unsupported scheme (expected http://host:port): {s}"));
			}

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (expected http://host:port without path/query/fragment): {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected http://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected http://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("invalid endpoint host (IPv6 must be bracketed like http://[::1]:8083): {s}"));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_with_and_without_scheme() {
			let a = BindEndpoint::parse("http://0.0.0.0:8083").unwrap();
			let b = BindEndpoint::parse("0.0.0.0:8083").unwrap();
			assert_eq!(a, b);
			assert_eq!(a.hostport(), "0.0.0.0:8083");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = BindEndpoint::parse("http://[::1]:8083").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.to_socket_addr().unwrap().to_string(), "[::1]:8083");
		}

		#[test]
		fn rejects_bad_inputs() {
			assert!(BindEndpoint::parse("").is_err());
			assert!(BindEndpoint::parse("https://127.0.0.1:8083").is_err());
			assert!(BindEndpoint::parse("http://127.0.0.1:8083/ws").is_err());
			assert!(BindEndpoint::parse("http://::1:8083").is_err());
			assert!(BindEndpoint::parse("http://127.0.0.1:0").is_err());
			assert!(BindEndpoint::parse("http://127.0.0.1").is_err());
		}

		#[test]
		fn dns_names_do_not_bind() {
			let e = BindEndpoint::parse("http://localhost:8083").unwrap();
			assert!(e.to_socket_addr().is_err());
		}
	}
}

pub mod text {
	/// Truncate to at most `max` chars, appending an ellipsis when cut.
	pub fn truncate_chars(s: &str, max: usize) -> String {
		match s.char_indices().nth(max) {
			Some((idx, _)) => format!("{}...", &s[..idx]),
			None => s.to_string(),
		}
	}

}
