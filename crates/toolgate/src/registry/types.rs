// Upstream server model.

use std::collections::HashMap;
use std::time::Duration;

use url::Url;

use crate::config::{ConfigError, UpstreamConfig};
use crate::registry::manifest;

/// A validated upstream server. Immutable after construction; the registry
/// replaces whole objects on refresh rather than mutating them.
#[derive(Debug, Clone)]
pub struct Upstream {
	pub name: String,
	pub endpoint: Url,
	pub namespace_prefix: String,
	pub enabled: bool,
	pub request_timeout: Duration,
	/// Merged into every outbound request without overriding headers the
	/// gateway already set.
	pub default_headers: HashMap<String, String>,
}

impl Upstream {
	pub fn from_config(config: &UpstreamConfig) -> Result<Self, ConfigError> {
		config.validate()?;
		let endpoint = Url::parse(&config.endpoint)
			.map_err(|e| ConfigError::Invalid(format!("upstream '{}': {e}", config.name)))?;
		Ok(Self {
			name: config.name.clone(),
			endpoint,
			namespace_prefix: config.namespace_prefix.clone(),
			enabled: config.enabled,
			request_timeout: config.request_timeout,
			default_headers: config.default_headers.clone(),
		})
	}

	/// URL the upstream's JSON-RPC endpoint answers on.
	pub fn rpc_url(&self) -> String {
		manifest::rpc_url(self.endpoint.as_str())
	}

	/// URL of the upstream's well-known manifest document.
	pub fn manifest_url(&self, manifest_path: &str) -> String {
		manifest::manifest_url(self.endpoint.as_str(), manifest_path)
	}
}
