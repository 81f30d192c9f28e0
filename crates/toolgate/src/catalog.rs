// Catalog aggregation: merging per-upstream tool lists into one immutable,
// atomically published snapshot.
//
// The aggregator owns the current `CatalogSnapshot` behind an `ArcSwap`.
// Readers load it lock-free; a single rebuild at a time (serialized by a
// mutex) fans out probe + tools/list pairs across the enabled upstreams with
// bounded concurrency, then publishes a complete new snapshot with one
// atomic store. The background refresher drives rebuilds on an interval and
// on discovery change-token fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;
use futures::StreamExt;
use itertools::Itertools;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::McpClient;
use crate::health::{HealthProbe, ProbeError};
use crate::jsonrpc::ToolEntry;
use crate::naming::ToolNameService;
use crate::registry::UpstreamRegistry;

/// Route from an external tool name to the upstream that serves it.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
	pub external_name: String,
	pub upstream_name: String,
	pub upstream_tool: String,
	pub description: Option<String>,
	/// Opaque; forwarded to clients untouched.
	pub input_schema: Option<Value>,
}

/// Immutable point-in-time catalog. Never mutated after publication; the
/// aggregator replaces the whole snapshot instead.
#[derive(Debug)]
pub struct CatalogSnapshot {
	pub created_at: SystemTime,
	pub tools_by_external_name: HashMap<String, ToolDescriptor>,
	pub upstream_health: HashMap<String, bool>,
	/// Opaque, monotonically increasing per aggregator. Zero only for the
	/// initial empty snapshot.
	pub source_version: u64,
	built_at: Instant,
}

impl CatalogSnapshot {
	fn empty() -> Self {
		Self::new(Vec::new(), HashMap::new(), 0)
	}

	pub fn new(
		tools: impl IntoIterator<Item = ToolDescriptor>,
		upstream_health: HashMap<String, bool>,
		source_version: u64,
	) -> Self {
		Self {
			created_at: SystemTime::now(),
			tools_by_external_name: tools
				.into_iter()
				.map(|descriptor| (descriptor.external_name.clone(), descriptor))
				.collect(),
			upstream_health,
			source_version,
			built_at: Instant::now(),
		}
	}

	pub fn get(&self, external_name: &str) -> Option<&ToolDescriptor> {
		self.tools_by_external_name.get(external_name)
	}

	pub fn is_upstream_healthy(&self, upstream_name: &str) -> bool {
		self.upstream_health
			.get(upstream_name)
			.copied()
			.unwrap_or(false)
	}

	/// Advertised tools, sorted by external name for stable listings.
	pub fn tool_entries(&self) -> Vec<ToolEntry> {
		self.tools_by_external_name
			.values()
			.sorted_by(|a, b| a.external_name.cmp(&b.external_name))
			.map(|descriptor| ToolEntry {
				name: descriptor.external_name.clone(),
				description: descriptor.description.clone(),
				input_schema: descriptor.input_schema.clone(),
			})
			.collect()
	}

	pub fn age(&self) -> Duration {
		self.built_at.elapsed()
	}
}

#[derive(Debug, Error)]
pub enum CatalogError {
	#[error("catalog rebuild cancelled")]
	Cancelled,
}

#[derive(Debug, Clone)]
pub struct CatalogOptions {
	/// Snapshots younger than this are served without a rebuild.
	pub freshness: Duration,
	/// Bound on concurrent upstream probe/fetch pairs during a rebuild.
	pub max_concurrent_probes: usize,
	/// Keep last-known-good tools of an unhealthy upstream, marked
	/// unhealthy, instead of dropping them.
	pub preserve_tools_on_failure: bool,
}

impl Default for CatalogOptions {
	fn default() -> Self {
		Self {
			freshness: Duration::from_secs(300),
			max_concurrent_probes: 10,
			preserve_tools_on_failure: false,
		}
	}
}

pub struct CatalogAggregator {
	registry: Arc<UpstreamRegistry>,
	client: McpClient,
	probe: HealthProbe,
	naming: ToolNameService,
	options: CatalogOptions,
	snapshot: ArcSwap<CatalogSnapshot>,
	rebuild_lock: tokio::sync::Mutex<()>,
	version: AtomicU64,
}

impl CatalogAggregator {
	pub fn new(
		registry: Arc<UpstreamRegistry>,
		client: McpClient,
		probe: HealthProbe,
		naming: ToolNameService,
		options: CatalogOptions,
	) -> Self {
		Self {
			registry,
			client,
			probe,
			naming,
			options,
			snapshot: ArcSwap::from_pointee(CatalogSnapshot::empty()),
			rebuild_lock: tokio::sync::Mutex::new(()),
			version: AtomicU64::new(0),
		}
	}

	pub fn registry(&self) -> &Arc<UpstreamRegistry> {
		&self.registry
	}

	/// Current snapshot. Never blocks.
	pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
		self.snapshot.load_full()
	}

	fn is_fresh(&self, snapshot: &CatalogSnapshot) -> bool {
		snapshot.source_version != 0 && snapshot.age() < self.options.freshness
	}

	/// Return the current snapshot if still fresh, otherwise rebuild.
	pub async fn ensure_fresh_snapshot(
		&self,
		cancel: &CancellationToken,
	) -> Result<Arc<CatalogSnapshot>, CatalogError> {
		let current = self.snapshot.load_full();
		if self.is_fresh(&current) {
			return Ok(current);
		}

		let guard = self.lock_rebuild(cancel).await?;
		// Another rebuild may have finished while we waited for the lock.
		let current = self.snapshot.load_full();
		if self.is_fresh(&current) {
			return Ok(current);
		}
		self.build_and_publish(cancel, guard).await
	}

	/// Rebuild and publish unconditionally (used by the refresher and by
	/// discovery change notifications). Concurrent rebuilds are serialized.
	pub async fn rebuild_now(
		&self,
		cancel: &CancellationToken,
	) -> Result<Arc<CatalogSnapshot>, CatalogError> {
		let guard = self.lock_rebuild(cancel).await?;
		self.build_and_publish(cancel, guard).await
	}

	async fn lock_rebuild<'a>(
		&'a self,
		cancel: &CancellationToken,
	) -> Result<tokio::sync::MutexGuard<'a, ()>, CatalogError> {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(CatalogError::Cancelled),
			guard = self.rebuild_lock.lock() => Ok(guard),
		}
	}

	async fn build_and_publish(
		&self,
		cancel: &CancellationToken,
		_guard: tokio::sync::MutexGuard<'_, ()>,
	) -> Result<Arc<CatalogSnapshot>, CatalogError> {
		let snapshot = Arc::new(self.build_snapshot(cancel).await?);
		self.snapshot.store(Arc::clone(&snapshot));
		debug!(
			target: "catalog",
			version = snapshot.source_version,
			tools = snapshot.tools_by_external_name.len(),
			upstreams = snapshot.upstream_health.len(),
			"published catalog snapshot"
		);
		Ok(snapshot)
	}

	async fn build_snapshot(
		&self,
		cancel: &CancellationToken,
	) -> Result<CatalogSnapshot, CatalogError> {
		let upstreams = self.registry.upstreams();
		let previous = self.snapshot.load_full();

		let probe = &self.probe;
		let client = &self.client;
		let mut results: Vec<_> = futures::stream::iter(upstreams.into_iter().enumerate())
			.map(|(order, upstream)| async move {
				let correlation = Uuid::new_v4().to_string();
				let (health, tools) = tokio::join!(
					probe.probe(&upstream, cancel),
					client.list_tools(&upstream, &correlation),
				);
				(order, upstream, health, tools)
			})
			.buffer_unordered(self.options.max_concurrent_probes.max(1))
			.collect()
			.await;

		// Restore input order so that name collisions resolve
		// deterministically: the first configured upstream wins.
		results.sort_by_key(|(order, ..)| *order);

		let mut tools_by_external_name = HashMap::new();
		let mut upstream_health = HashMap::new();

		for (_, upstream, health, tools) in results {
			let health = match health {
				Ok(health) => health,
				Err(ProbeError::Cancelled) => return Err(CatalogError::Cancelled),
			};

			let entries = match (health.healthy, tools) {
				(true, Ok(entries)) => {
					upstream_health.insert(upstream.name.clone(), true);
					entries
				},
				(true, Err(e)) => {
					warn!(target: "catalog", upstream = %upstream.name, error = %e, "tools/list fetch failed");
					upstream_health.insert(upstream.name.clone(), false);
					self.preserve_previous(&upstream.name, &previous, &mut tools_by_external_name);
					continue;
				},
				(false, _) => {
					warn!(
						target: "catalog",
						upstream = %upstream.name,
						strategy = health.strategy.as_str(),
						error = health.error_message.as_deref().unwrap_or("unknown"),
						"upstream probe failed"
					);
					upstream_health.insert(upstream.name.clone(), false);
					self.preserve_previous(&upstream.name, &previous, &mut tools_by_external_name);
					continue;
				},
			};

			for entry in entries {
				let external = match self
					.naming
					.to_external(&upstream.namespace_prefix, &entry.name)
				{
					Ok(external) => external,
					Err(e) => {
						warn!(target: "catalog", upstream = %upstream.name, tool = %entry.name, error = %e, "skipping unnameable tool");
						continue;
					},
				};
				if tools_by_external_name.contains_key(&external) {
					warn!(
						target: "catalog",
						tool = %external,
						upstream = %upstream.name,
						"discarding tool with colliding external name"
					);
					continue;
				}
				tools_by_external_name.insert(
					external.clone(),
					ToolDescriptor {
						external_name: external,
						upstream_name: upstream.name.clone(),
						upstream_tool: entry.name,
						description: entry.description,
						input_schema: entry.input_schema,
					},
				);
			}
		}

		Ok(CatalogSnapshot {
			created_at: SystemTime::now(),
			tools_by_external_name,
			upstream_health,
			source_version: self.version.fetch_add(1, Ordering::Relaxed) + 1,
			built_at: Instant::now(),
		})
	}

	fn preserve_previous(
		&self,
		upstream_name: &str,
		previous: &CatalogSnapshot,
		tools: &mut HashMap<String, ToolDescriptor>,
	) {
		if !self.options.preserve_tools_on_failure {
			return;
		}
		for (external, descriptor) in &previous.tools_by_external_name {
			if descriptor.upstream_name == upstream_name && !tools.contains_key(external) {
				tools.insert(external.clone(), descriptor.clone());
			}
		}
	}

	/// Background refresh loop: rebuild, sleep, repeat until shutdown. A
	/// discovery change token triggers an immediate registry refresh and
	/// rebuild. Failures are logged and never terminate the loop.
	pub fn spawn_refresh_loop(
		self: Arc<Self>,
		interval: Duration,
		shutdown: CancellationToken,
	) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			debug!(target: "catalog", ?interval, "starting catalog refresh loop");
			let change = self.registry.watch();
			loop {
				if let Err(e) = self.registry.refresh(&shutdown).await {
					warn!(target: "catalog", error = %e, "registry refresh failed");
				}
				if shutdown.is_cancelled() {
					break;
				}
				if let Err(e) = self.rebuild_now(&shutdown).await {
					warn!(target: "catalog", error = %e, "catalog rebuild failed");
				}

				tokio::select! {
					_ = shutdown.cancelled() => break,
					_ = tokio::time::sleep(interval) => {},
					_ = wait_for_change(change.as_ref()) => {
						debug!(target: "catalog", "discovery change token fired, refreshing");
					},
				}
			}
			debug!(target: "catalog", "catalog refresh loop stopped");
		})
	}
}

async fn wait_for_change(token: Option<&crate::registry::ChangeToken>) {
	match token {
		Some(token) => token.changed().await,
		None => futures::future::pending::<()>().await,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;
	use crate::client::HttpClientFactory;
	use crate::config::UpstreamConfig;

	async fn mock_upstream(tools: Value) -> MockServer {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/.well-known/mcp/manifest.json"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/mcp/v1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"jsonrpc": "2.0",
				"id": "1",
				"result": {"tools": tools}
			})))
			.mount(&server)
			.await;
		server
	}

	async fn broken_upstream() -> MockServer {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;
		server
	}

	fn upstream_config(name: &str, prefix: &str, server: &MockServer) -> UpstreamConfig {
		serde_yaml::from_str(&format!(
			"{{name: {name}, endpoint: \"{}/mcp\", namespacePrefix: \"{prefix}\", requestTimeout: \"2s\"}}",
			server.uri()
		))
		.unwrap()
	}

	fn aggregator(registry: Arc<UpstreamRegistry>, options: CatalogOptions) -> CatalogAggregator {
		let factory = HttpClientFactory::default();
		CatalogAggregator::new(
			registry,
			McpClient::new(factory.clone()),
			HealthProbe::new(factory, "mcp/manifest.json"),
			ToolNameService::default(),
			options,
		)
	}

	#[tokio::test]
	async fn test_rebuild_aggregates_and_prefixes_tools() {
		let wx = mock_upstream(json!([{"name": "forecast", "description": "hourly"}])).await;
		let pay = mock_upstream(json!([{"name": "create"}, {"name": "refund"}])).await;
		let registry = Arc::new(UpstreamRegistry::from_static(&[
			upstream_config("wx", "wx", &wx),
			upstream_config("payments", "payments", &pay),
		]));

		let aggregator = aggregator(registry, CatalogOptions::default());
		let snapshot = aggregator
			.rebuild_now(&CancellationToken::new())
			.await
			.unwrap();

		assert_eq!(snapshot.tools_by_external_name.len(), 3);
		let forecast = snapshot.get("wx.forecast").unwrap();
		assert_eq!(forecast.upstream_name, "wx");
		assert_eq!(forecast.upstream_tool, "forecast");
		assert_eq!(forecast.description.as_deref(), Some("hourly"));
		assert!(snapshot.get("payments.create").is_some());
		assert!(snapshot.is_upstream_healthy("wx"));
		assert!(snapshot.is_upstream_healthy("payments"));
		assert_eq!(snapshot.source_version, 1);
	}

	#[tokio::test]
	async fn test_unhealthy_upstream_drops_tools_by_default() {
		let wx = mock_upstream(json!([{"name": "forecast"}])).await;
		let broken = broken_upstream().await;
		let registry = Arc::new(UpstreamRegistry::from_static(&[
			upstream_config("wx", "wx", &wx),
			upstream_config("bad", "bad", &broken),
		]));

		let aggregator = aggregator(registry, CatalogOptions::default());
		let snapshot = aggregator
			.rebuild_now(&CancellationToken::new())
			.await
			.unwrap();

		assert!(snapshot.get("wx.forecast").is_some());
		assert!(!snapshot.is_upstream_healthy("bad"));
		// Health is tracked for every enabled upstream, tools only for
		// healthy ones.
		assert_eq!(snapshot.upstream_health.len(), 2);
		assert_eq!(snapshot.tools_by_external_name.len(), 1);
	}

	#[tokio::test]
	async fn test_external_name_collision_first_wins() {
		// prefix "a" + tool "b.c" collides with prefix "a.b" + tool "c".
		let first = mock_upstream(json!([{"name": "b.c", "description": "winner"}])).await;
		let second = mock_upstream(json!([{"name": "c", "description": "loser"}])).await;
		let registry = Arc::new(UpstreamRegistry::from_static(&[
			upstream_config("first", "a", &first),
			upstream_config("second", "a.b", &second),
		]));

		let aggregator = aggregator(registry, CatalogOptions::default());
		let snapshot = aggregator
			.rebuild_now(&CancellationToken::new())
			.await
			.unwrap();

		let descriptor = snapshot.get("a.b.c").unwrap();
		assert_eq!(descriptor.upstream_name, "first");
		assert_eq!(descriptor.description.as_deref(), Some("winner"));
	}

	#[tokio::test]
	async fn test_preserve_tools_on_failure() {
		let wx = mock_upstream(json!([{"name": "forecast"}])).await;
		let registry = Arc::new(UpstreamRegistry::from_static(&[upstream_config(
			"wx", "wx", &wx,
		)]));

		let options = CatalogOptions {
			freshness: Duration::ZERO,
			preserve_tools_on_failure: true,
			..CatalogOptions::default()
		};
		let aggregator = aggregator(registry, options);
		let healthy = aggregator
			.rebuild_now(&CancellationToken::new())
			.await
			.unwrap();
		assert!(healthy.is_upstream_healthy("wx"));

		// The upstream goes away; its last-known-good tools survive but the
		// upstream is marked unhealthy.
		wx.reset().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&wx)
			.await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&wx)
			.await;

		let degraded = aggregator
			.rebuild_now(&CancellationToken::new())
			.await
			.unwrap();
		assert!(!degraded.is_upstream_healthy("wx"));
		assert!(degraded.get("wx.forecast").is_some());
	}

	#[tokio::test]
	async fn test_ensure_fresh_reuses_young_snapshot() {
		let wx = mock_upstream(json!([{"name": "forecast"}])).await;
		let registry = Arc::new(UpstreamRegistry::from_static(&[upstream_config(
			"wx", "wx", &wx,
		)]));

		let aggregator = aggregator(registry, CatalogOptions::default());
		let cancel = CancellationToken::new();
		let first = aggregator.ensure_fresh_snapshot(&cancel).await.unwrap();
		let second = aggregator.ensure_fresh_snapshot(&cancel).await.unwrap();
		assert_eq!(first.source_version, second.source_version);
	}

	#[tokio::test]
	async fn test_stale_snapshot_is_rebuilt_and_old_one_unchanged() {
		let wx = mock_upstream(json!([{"name": "forecast"}])).await;
		let registry = Arc::new(UpstreamRegistry::from_static(&[upstream_config(
			"wx", "wx", &wx,
		)]));

		let options = CatalogOptions {
			freshness: Duration::ZERO,
			..CatalogOptions::default()
		};
		let aggregator = aggregator(registry, options);
		let cancel = CancellationToken::new();
		let first = aggregator.ensure_fresh_snapshot(&cancel).await.unwrap();
		let second = aggregator.ensure_fresh_snapshot(&cancel).await.unwrap();

		assert!(second.source_version > first.source_version);
		// The old snapshot is a distinct, still-intact object.
		assert_eq!(first.tools_by_external_name.len(), 1);
		assert!(first.get("wx.forecast").is_some());
	}

	#[tokio::test]
	async fn test_rebuild_cancelled() {
		let wx = mock_upstream(json!([])).await;
		let registry = Arc::new(UpstreamRegistry::from_static(&[upstream_config(
			"wx", "wx", &wx,
		)]));
		let aggregator = aggregator(registry, CatalogOptions::default());
		let cancel = CancellationToken::new();
		cancel.cancel();
		assert!(matches!(
			aggregator.rebuild_now(&cancel).await,
			Err(CatalogError::Cancelled)
		));
	}

	#[tokio::test]
	async fn test_refresh_loop_populates_and_stops() {
		let wx = mock_upstream(json!([{"name": "forecast"}])).await;
		let registry = Arc::new(UpstreamRegistry::from_static(&[upstream_config(
			"wx", "wx", &wx,
		)]));
		let aggregator = Arc::new(aggregator(registry, CatalogOptions::default()));

		let shutdown = CancellationToken::new();
		let handle = Arc::clone(&aggregator).spawn_refresh_loop(Duration::from_secs(60), shutdown.clone());

		// The first loop iteration publishes a snapshot.
		tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				if aggregator.snapshot().source_version > 0 {
					break;
				}
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.expect("refresh loop should publish a snapshot");

		assert!(aggregator.snapshot().get("wx.forecast").is_some());
		shutdown.cancel();
		tokio::time::timeout(Duration::from_secs(5), handle)
			.await
			.expect("loop should stop on shutdown")
			.unwrap();
	}
}
