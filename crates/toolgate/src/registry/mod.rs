// Upstream registry: the dynamic, thread-safe catalog of upstream servers.
//
// Reads are lock-free: the registry publishes an immutable `UpstreamSet`
// through an `ArcSwap` and replaces it wholesale after a successful refresh.
// Refreshes are serialized behind a single mutex; a failed refresh leaves
// the published set untouched.

pub mod crawl;
pub mod discovery;
pub mod manifest;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::UpstreamConfig;
pub use crawl::ManifestCrawlDiscovery;
pub use discovery::{ChangeToken, DiscoveryError, DiscoveryProvider, StaticDiscovery};
pub use manifest::ServiceManifest;
pub use types::Upstream;

/// Point-in-time view of the discovered upstreams. Built once per refresh
/// and never mutated afterwards.
#[derive(Debug, Default)]
pub struct UpstreamSet {
	all: Vec<Arc<Upstream>>,
	enabled: Vec<Arc<Upstream>>,
	by_name: HashMap<String, Arc<Upstream>>,
}

impl UpstreamSet {
	/// Validate and deduplicate candidates, in input order. Invalid entries
	/// and duplicates are skipped with a warning; they never abort the pass.
	fn build(candidates: &[UpstreamConfig]) -> Self {
		let mut set = Self::default();
		let mut prefixes = HashSet::new();

		for candidate in candidates {
			let upstream = match Upstream::from_config(candidate) {
				Ok(upstream) => upstream,
				Err(e) => {
					warn!(target: "registry", upstream = %candidate.name, error = %e, "skipping invalid upstream");
					continue;
				},
			};
			if set.by_name.contains_key(&upstream.name) {
				warn!(target: "registry", upstream = %upstream.name, "skipping duplicate upstream name");
				continue;
			}
			if upstream.enabled && !prefixes.insert(upstream.namespace_prefix.clone()) {
				warn!(
					target: "registry",
					upstream = %upstream.name,
					prefix = %upstream.namespace_prefix,
					"skipping upstream with duplicate namespace prefix"
				);
				continue;
			}

			let upstream = Arc::new(upstream);
			set.by_name
				.insert(upstream.name.clone(), Arc::clone(&upstream));
			if upstream.enabled {
				set.enabled.push(Arc::clone(&upstream));
			}
			set.all.push(upstream);
		}
		set
	}
}

pub struct UpstreamRegistry {
	current: ArcSwap<UpstreamSet>,
	provider: Option<Arc<dyn DiscoveryProvider>>,
	refresh_lock: tokio::sync::Mutex<()>,
}

impl UpstreamRegistry {
	/// Registry over a statically configured upstream list. `refresh` is a
	/// no-op for this variant.
	pub fn from_static(upstreams: &[UpstreamConfig]) -> Self {
		Self {
			current: ArcSwap::from_pointee(UpstreamSet::build(upstreams)),
			provider: None,
			refresh_lock: tokio::sync::Mutex::new(()),
		}
	}

	/// Registry fed by a discovery provider. Starts empty; call `refresh`
	/// to populate.
	pub fn with_provider(provider: Arc<dyn DiscoveryProvider>) -> Self {
		Self {
			current: ArcSwap::from_pointee(UpstreamSet::default()),
			provider: Some(provider),
			refresh_lock: tokio::sync::Mutex::new(()),
		}
	}

	/// Enabled upstreams from the current set. Lock-free.
	pub fn upstreams(&self) -> Vec<Arc<Upstream>> {
		self.current.load().enabled.clone()
	}

	/// All discovered upstreams, including disabled ones. Lock-free.
	pub fn all_upstreams(&self) -> Vec<Arc<Upstream>> {
		self.current.load().all.clone()
	}

	/// Look up an upstream by name. Lock-free.
	pub fn get(&self, name: &str) -> Option<Arc<Upstream>> {
		self.current.load().by_name.get(name).map(Arc::clone)
	}

	/// Re-discover upstreams and atomically publish the new set. Concurrent
	/// refreshes are serialized; a provider failure preserves the published
	/// set.
	pub async fn refresh(&self, cancel: &CancellationToken) -> Result<(), DiscoveryError> {
		let Some(provider) = &self.provider else {
			// Static registries hold the configured list.
			return Ok(());
		};

		let _guard = tokio::select! {
			biased;
			_ = cancel.cancelled() => return Err(DiscoveryError::Cancelled),
			guard = self.refresh_lock.lock() => guard,
		};

		let candidates = provider.discover(cancel).await?;
		let set = UpstreamSet::build(&candidates);
		tracing::debug!(
			target: "registry",
			total = set.all.len(),
			enabled = set.enabled.len(),
			"publishing refreshed upstream set"
		);
		self.current.store(Arc::new(set));
		Ok(())
	}

	/// Change token of the underlying provider, if it supports one.
	pub fn watch(&self) -> Option<ChangeToken> {
		self.provider.as_ref().and_then(|p| p.watch())
	}
}
