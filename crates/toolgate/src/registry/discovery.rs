// Discovery provider contract.
//
// Concrete backends (service catalogs, file watchers) live outside the core;
// they plug in through `DiscoveryProvider`. The in-tree `StaticDiscovery`
// serves the statically configured upstream list.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::UpstreamConfig;

#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("discovery failed: {0}")]
	Provider(String),

	#[error("discovery cancelled")]
	Cancelled,
}

/// Signal that a provider's view of the world has changed.
///
/// Tokens are single-shot: each trigger releases at most one pending
/// `changed()` wait, and the consumer re-arms by awaiting again. A trigger
/// with no waiter is remembered until the next `changed()` call.
#[derive(Debug, Clone, Default)]
pub struct ChangeToken {
	notify: Arc<Notify>,
}

impl ChangeToken {
	pub fn new() -> Self {
		Self::default()
	}

	/// Resolve when the provider signals a change.
	pub async fn changed(&self) {
		self.notify.notified().await;
	}

	/// Fire the token. Called by the provider side.
	pub fn trigger(&self) {
		self.notify.notify_one();
	}
}

/// Source of upstream candidates.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
	/// Produce the provider's current set of upstream candidates. Candidates
	/// are validated and deduplicated by the registry, not here.
	async fn discover(
		&self,
		cancel: &CancellationToken,
	) -> Result<Vec<UpstreamConfig>, DiscoveryError>;

	/// A change token the refresher can watch, when the provider supports
	/// change notification.
	fn watch(&self) -> Option<ChangeToken> {
		None
	}
}

/// Discovery provider over a fixed, statically configured list.
pub struct StaticDiscovery {
	upstreams: Vec<UpstreamConfig>,
}

impl StaticDiscovery {
	pub fn new(upstreams: Vec<UpstreamConfig>) -> Self {
		Self { upstreams }
	}
}

#[async_trait]
impl DiscoveryProvider for StaticDiscovery {
	async fn discover(
		&self,
		_cancel: &CancellationToken,
	) -> Result<Vec<UpstreamConfig>, DiscoveryError> {
		Ok(self.upstreams.clone())
	}
}
