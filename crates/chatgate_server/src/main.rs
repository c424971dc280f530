#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chatgate_backend::{HttpAuthBackend, OpenAiCompletion};
use chatgate_util::endpoint::BindEndpoint;
use futures::future::join_all;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::audit::AuditService;
use crate::server::http::{HealthState, HttpContext, HttpSettings, serve};
use crate::server::state::{GatewayState, SessionSettings};

const DEFAULT_BIND: &str = "http://127.0.0.1:8083";
const SHUTDOWN_REASON: &str = "server shutting down, session closed";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatgate_server [--bind http://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: {DEFAULT_BIND})\n\
\t          Format: http://host:port\n\
\t--config   Config file (default: ~/.chatgate/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected http://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn resolve_bind(raw: &str) -> SocketAddr {
	let bind = BindEndpoint::parse(raw).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatgate_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("chatgate_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_raw = args
		.bind
		.or_else(|| server_cfg.server.bind.clone())
		.unwrap_or_else(|| DEFAULT_BIND.to_string());
	let bind_addr = resolve_bind(&bind_raw);

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let auth = HttpAuthBackend::new(
		&server_cfg.core.base_url,
		server_cfg.core.access_key.clone().unwrap_or_default(),
		server_cfg.core.request_timeout,
	)
	.context("build authorization backend client")?;
	info!(base_url = %server_cfg.core.base_url, "authorization backend configured");

	let audit_service = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		Arc::new(AuditService::connect(database_url).await?)
	} else {
		Arc::new(AuditService::disabled())
	};
	info!(enabled = audit_service.is_enabled(), "local turn mirror");

	let state = Arc::new(GatewayState::new(
		Arc::new(auth),
		Arc::new(OpenAiCompletion::new()),
		audit_service,
		SessionSettings::from_server(&server_cfg.server),
	));

	let health = HealthState::new();
	let ctx = Arc::new(HttpContext::new(
		Arc::clone(&state),
		health.clone(),
		HttpSettings {
			base_path: server_cfg.server.base_path.clone(),
			login_url: server_cfg.server.login_url.clone(),
			auth_hmac_secret: server_cfg.server.auth_hmac_secret.clone(),
		},
	));

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(bind = %bind_addr, base_path = %server_cfg.server.base_path, "chatgate_server: listening");
	health.mark_ready();

	let shutdown = CancellationToken::new();
	let server = tokio::spawn(serve(listener, ctx, shutdown.clone()));

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutdown requested");
	shutdown.cancel();

	debug!(sessions = ?state.registry.ids(), "closing live sessions");
	let handles = state.registry.handles();
	join_all(handles.iter().map(|h| h.close(SHUTDOWN_REASON))).await;
	info!(closed = handles.len(), "sessions closed");

	match server.await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => warn!(error = %e, "http listener exited with error"),
		Err(e) => warn!(error = %e, "http listener task failed"),
	}

	Ok(())
}
