// Manifest-crawl discovery: poll a fixed set of service roots for their
// well-known manifests and turn the answers into upstream candidates.
//
// This is the in-tree polling provider; catalog-backed providers (Consul and
// friends) implement the same `DiscoveryProvider` contract externally. The
// poll loop fingerprints each pass and fires the change token when the set
// of discovered services differs from the previous pass, so the refresher
// picks up fleet changes before its next scheduled interval.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::xxhash32;
use crate::client::HttpClientFactory;
use crate::config::UpstreamConfig;
use crate::registry::discovery::{ChangeToken, DiscoveryError, DiscoveryProvider};
use crate::registry::manifest::{ServiceManifest, manifest_url};

pub struct ManifestCrawlDiscovery {
	factory: HttpClientFactory,
	manifest_path: String,
	/// Service roots to crawl, e.g. `http://wx.internal:9000`.
	roots: Vec<String>,
	change: ChangeToken,
	last_fingerprint: Mutex<Option<u32>>,
}

impl ManifestCrawlDiscovery {
	pub fn new(
		factory: HttpClientFactory,
		manifest_path: impl Into<String>,
		roots: Vec<String>,
	) -> Self {
		Self {
			factory,
			manifest_path: manifest_path.into(),
			roots,
			change: ChangeToken::new(),
			last_fingerprint: Mutex::new(None),
		}
	}

	async fn crawl_root(&self, root: &str) -> Option<UpstreamConfig> {
		let url = manifest_url(root, &self.manifest_path);
		let client = self.factory.client_for(root);
		let response = match client.get(&url).send().await {
			Ok(response) => response,
			Err(e) => {
				warn!(target: "discovery", root, error = %e, "manifest crawl failed");
				return None;
			},
		};
		if !response.status().is_success() {
			warn!(
				target: "discovery",
				root,
				status = response.status().as_u16(),
				"manifest crawl got non-success status"
			);
			return None;
		}
		let mut manifest: ServiceManifest = match response.json().await {
			Ok(manifest) => manifest,
			Err(e) => {
				warn!(target: "discovery", root, error = %e, "manifest did not parse");
				return None;
			},
		};

		// A manifest that names no endpoint advertises the root it was
		// served from.
		if manifest.mcp_http_endpoint.is_none() {
			manifest.mcp_http_endpoint = Some(root.to_string());
		}
		let candidate = manifest.into_candidate();
		if candidate.is_none() {
			warn!(target: "discovery", root, "manifest lacked a usable name or prefix");
		}
		candidate
	}

	/// Poll until shutdown, firing the change token whenever the discovered
	/// set differs from the previous pass.
	pub fn spawn_poll_loop(
		self: std::sync::Arc<Self>,
		interval: Duration,
		shutdown: CancellationToken,
	) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			debug!(target: "discovery", ?interval, roots = self.roots.len(), "starting manifest poll loop");
			loop {
				tokio::select! {
					_ = shutdown.cancelled() => break,
					_ = tokio::time::sleep(interval) => {},
				}
				match self.discover(&shutdown).await {
					Ok(candidates) => self.note_pass(&candidates),
					Err(e) => warn!(target: "discovery", error = %e, "manifest poll failed"),
				}
			}
			debug!(target: "discovery", "manifest poll loop stopped");
		})
	}

	/// Record a discovery pass; fires the change token when the fingerprint
	/// moved relative to the previously seen pass.
	fn note_pass(&self, candidates: &[UpstreamConfig]) {
		let fingerprint = fingerprint(candidates);
		let mut last = self.last_fingerprint.lock();
		match *last {
			Some(previous) if previous == fingerprint => {},
			Some(_) => {
				debug!(target: "discovery", "discovered service set changed");
				*last = Some(fingerprint);
				self.change.trigger();
			},
			None => {
				*last = Some(fingerprint);
			},
		}
	}
}

fn fingerprint(candidates: &[UpstreamConfig]) -> u32 {
	let mut digest = 0u32;
	for candidate in candidates {
		let line = format!(
			"{}\u{1}{}\u{1}{}\u{1}{}",
			candidate.name, candidate.endpoint, candidate.namespace_prefix, candidate.enabled
		);
		digest = xxhash32(line.as_bytes(), digest);
	}
	digest
}

#[async_trait]
impl DiscoveryProvider for ManifestCrawlDiscovery {
	async fn discover(
		&self,
		cancel: &CancellationToken,
	) -> Result<Vec<UpstreamConfig>, DiscoveryError> {
		let mut candidates = Vec::with_capacity(self.roots.len());
		for root in &self.roots {
			if cancel.is_cancelled() {
				return Err(DiscoveryError::Cancelled);
			}
			if let Some(candidate) = self.crawl_root(root).await {
				candidates.push(candidate);
			}
		}
		debug!(
			target: "discovery",
			roots = self.roots.len(),
			discovered = candidates.len(),
			"manifest crawl pass complete"
		);
		Ok(candidates)
	}

	fn watch(&self) -> Option<ChangeToken> {
		Some(self.change.clone())
	}
}
