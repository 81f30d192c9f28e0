use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolgate::client::HttpClientFactory;
use toolgate::config::GatewayConfig;
use toolgate::registry::{ManifestCrawlDiscovery, UpstreamRegistry};
use toolgate::server::{self, GatewayState};

#[derive(Parser, Debug)]
#[command(name = "toolgate", version, about = "Multi-tenant MCP tool gateway")]
struct Args {
	/// Path to the YAML configuration file. Defaults are used when omitted.
	#[arg(short, long)]
	config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let args = Args::parse();
	let config = match &args.config {
		Some(path) => GatewayConfig::load(path)
			.with_context(|| format!("loading config from {}", path.display()))?,
		None => GatewayConfig::default(),
	};

	let shutdown = CancellationToken::new();
	let mut background = Vec::new();

	let state = if config.discovery.manifest_roots.is_empty() {
		GatewayState::from_config(&config, shutdown.clone())
			.context("building gateway from config")?
	} else {
		let provider = Arc::new(ManifestCrawlDiscovery::new(
			HttpClientFactory::default(),
			&config.manifest_path,
			config.discovery.manifest_roots.clone(),
		));
		background.push(
			Arc::clone(&provider).spawn_poll_loop(config.discovery.poll_interval, shutdown.clone()),
		);
		let registry = Arc::new(UpstreamRegistry::with_provider(provider));
		GatewayState::with_registry(&config, registry, shutdown.clone())
			.context("building gateway from config")?
	};

	background.push(
		Arc::clone(&state.aggregator)
			.spawn_refresh_loop(config.catalog_refresh_interval, shutdown.clone()),
	);
	if state.limiter.is_enabled() {
		background.push(
			Arc::clone(&state.limiter)
				.spawn_cleanup_loop(config.rate_limit.cleanup_interval, shutdown.clone()),
		);
	}

	let listener = tokio::net::TcpListener::bind(&config.listen)
		.await
		.with_context(|| format!("binding {}", config.listen))?;
	info!(
		listen = %config.listen,
		upstreams = config.upstreams.len(),
		"toolgate listening"
	);

	let app = server::router(Arc::clone(&state));
	let signal_token = shutdown.clone();
	axum::serve(listener, app)
		.with_graceful_shutdown(async move {
			let _ = tokio::signal::ctrl_c().await;
			info!("shutdown signal received");
			signal_token.cancel();
		})
		.await
		.context("serving MCP endpoint")?;

	shutdown.cancel();
	for task in background {
		let _ = task.await;
	}
	info!("toolgate stopped");
	Ok(())
}
