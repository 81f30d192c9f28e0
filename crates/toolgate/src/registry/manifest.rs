// Well-known service manifests.
//
// An upstream may describe itself through a small JSON document served at
// `{service root}/.well-known/<manifest-path>`. Manifest-crawl discovery
// providers turn these documents into upstream candidates; the gateway also
// serves one describing itself.

use serde::{Deserialize, Serialize};

use crate::config::UpstreamConfig;
use crate::naming::validate_prefix;

/// The manifest document. All fields are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceManifest {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub service_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mcp_http_endpoint: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub namespace_prefix: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub request_timeout_seconds: Option<u64>,
}

impl ServiceManifest {
	/// Convert a crawled manifest into an upstream candidate. Returns `None`
	/// when the manifest lacks a name, endpoint, or valid prefix.
	pub fn into_candidate(self) -> Option<UpstreamConfig> {
		let name = self.service_name?;
		let endpoint = self.mcp_http_endpoint?;
		let prefix = self.namespace_prefix?;
		validate_prefix(&prefix).ok()?;

		Some(UpstreamConfig {
			name,
			endpoint,
			namespace_prefix: prefix,
			enabled: true,
			request_timeout: self
				.request_timeout_seconds
				.map(std::time::Duration::from_secs)
				.unwrap_or_else(crate::config::default_request_timeout),
			default_headers: std::collections::HashMap::new(),
		})
	}
}

/// URL of the JSON-RPC endpoint for a configured upstream endpoint. The
/// canonical rpc path is `<service root>/mcp/v1`; an endpoint configured
/// with the `/mcp` suffix only needs `/v1` appended.
pub fn rpc_url(endpoint: &str) -> String {
	let base = endpoint.trim_end_matches('/');
	if base.ends_with("/mcp") {
		format!("{base}/v1")
	} else {
		format!("{base}/mcp/v1")
	}
}

/// URL of the well-known manifest for a configured upstream endpoint. The
/// manifest lives at the service root, so a trailing `/mcp` is stripped.
pub fn manifest_url(endpoint: &str, manifest_path: &str) -> String {
	let base = endpoint.trim_end_matches('/');
	let root = base.strip_suffix("/mcp").unwrap_or(base);
	format!("{root}/.well-known/{manifest_path}")
}
