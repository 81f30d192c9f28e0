// Gateway configuration.
//
// Loaded from YAML by the binary, validated once at startup. Every field has
// a default so a minimal config is just an upstream list. Durations accept
// human strings ("5m", "30s", "250ms").

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::naming::validate_prefix;
use crate::patterns::{CompiledPattern, PatternError};
use crate::ratelimit::QuotaPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to parse config file: {0}")]
	Yaml(#[from] serde_yaml::Error),

	#[error("invalid pattern: {0}")]
	Pattern(#[from] PatternError),

	#[error("invalid duration '{0}'")]
	InvalidDuration(String),

	#[error("invalid configuration: {0}")]
	Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
	/// Listen address for the MCP HTTP endpoint.
	#[serde(default = "default_listen")]
	pub listen: String,

	/// Separator between namespace prefix and upstream tool name.
	#[serde(default = "default_separator")]
	pub tool_name_separator: String,

	/// Policy decision when no allow/deny pattern matches.
	#[serde(default)]
	pub deny_by_default: bool,

	/// Background catalog refresh period.
	#[serde(default = "default_refresh_interval", with = "duration_str")]
	pub catalog_refresh_interval: Duration,

	/// How long a snapshot is considered fresh before `ensure_fresh`
	/// rebuilds it.
	#[serde(default = "default_refresh_interval", with = "duration_str")]
	pub catalog_freshness: Duration,

	#[serde(default)]
	pub allowed_tool_patterns: Vec<String>,

	#[serde(default)]
	pub denied_tool_patterns: Vec<String>,

	/// Statically configured upstreams.
	#[serde(default)]
	pub upstreams: Vec<UpstreamConfig>,

	/// Manifest-crawl discovery; when roots are configured they replace the
	/// static upstream list as the source of truth.
	#[serde(default)]
	pub discovery: DiscoveryConfig,

	#[serde(default)]
	pub rate_limit: RateLimitConfig,

	#[serde(default)]
	pub tenant_resolution: TenantResolutionConfig,

	/// Bound on concurrent upstream probes during a catalog rebuild.
	#[serde(default = "default_max_concurrent_probes")]
	pub max_concurrent_probes: usize,

	/// Keep last-known-good tools of an unhealthy upstream in the snapshot
	/// (marked unhealthy) instead of dropping them.
	#[serde(default)]
	pub preserve_tools_on_failure: bool,

	/// Well-known path under which service manifests live.
	#[serde(default = "default_manifest_path")]
	pub manifest_path: String,

	#[serde(default)]
	pub retry: RetryConfig,

	#[serde(default)]
	pub server_info: ServerInfoConfig,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		serde_yaml::from_str("{}").expect("empty config deserializes")
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
	pub name: String,
	pub endpoint: String,
	pub namespace_prefix: String,
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_request_timeout", with = "duration_str")]
	pub request_timeout: Duration,
	#[serde(default)]
	pub default_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
	/// Service roots whose well-known manifests are crawled for upstream
	/// candidates.
	#[serde(default)]
	pub manifest_roots: Vec<String>,
	#[serde(default = "default_poll_interval", with = "duration_str")]
	pub poll_interval: Duration,
}

impl Default for DiscoveryConfig {
	fn default() -> Self {
		Self {
			manifest_roots: Vec::new(),
			poll_interval: default_poll_interval(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub default_quota_policy: Option<QuotaPolicy>,
	/// Wildcard pattern -> policy overrides, evaluated before the default.
	#[serde(default)]
	pub overrides: HashMap<String, QuotaPolicy>,
	#[serde(default = "default_rate_limit_cache_size")]
	pub max_cache_size: usize,
	#[serde(default = "default_cleanup_interval", with = "duration_str")]
	pub cleanup_interval: Duration,
	#[serde(default = "default_entry_expiration", with = "duration_str")]
	pub entry_expiration: Duration,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			default_quota_policy: None,
			overrides: HashMap::new(),
			max_cache_size: default_rate_limit_cache_size(),
			cleanup_interval: default_cleanup_interval(),
			entry_expiration: default_entry_expiration(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantResolutionConfig {
	#[serde(default = "default_tenant_header")]
	pub tenant_header_name: String,
	#[serde(default = "default_user_header")]
	pub user_header_name: String,
}

impl Default for TenantResolutionConfig {
	fn default() -> Self {
		Self {
			tenant_header_name: default_tenant_header(),
			user_header_name: default_user_header(),
		}
	}
}

/// Outbound retry tuning. `attempts` is the total attempt budget; a single
/// attempt means no retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
	#[serde(default = "default_attempts")]
	pub attempts: u32,
	#[serde(default, with = "duration_opt_str", skip_serializing_if = "Option::is_none")]
	pub backoff: Option<Duration>,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			attempts: default_attempts(),
			backoff: None,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfoConfig {
	#[serde(default = "default_server_name")]
	pub name: String,
	#[serde(default = "default_server_version")]
	pub version: String,
}

impl Default for ServerInfoConfig {
	fn default() -> Self {
		Self {
			name: default_server_name(),
			version: default_server_version(),
		}
	}
}

fn default_listen() -> String {
	"127.0.0.1:3000".to_string()
}

fn default_separator() -> String {
	".".to_string()
}

fn default_refresh_interval() -> Duration {
	Duration::from_secs(300)
}

fn default_max_concurrent_probes() -> usize {
	10
}

fn default_poll_interval() -> Duration {
	Duration::from_secs(60)
}

fn default_manifest_path() -> String {
	"mcp/manifest.json".to_string()
}

fn default_true() -> bool {
	true
}

pub(crate) fn default_request_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_rate_limit_cache_size() -> usize {
	10_000
}

fn default_cleanup_interval() -> Duration {
	Duration::from_secs(300)
}

fn default_entry_expiration() -> Duration {
	Duration::from_secs(600)
}

fn default_attempts() -> u32 {
	1
}

fn default_tenant_header() -> String {
	"X-Tenant-Id".to_string()
}

fn default_user_header() -> String {
	"X-User-Id".to_string()
}

fn default_server_name() -> String {
	"toolgate".to_string()
}

fn default_server_version() -> String {
	env!("CARGO_PKG_VERSION").to_string()
}

impl GatewayConfig {
	pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path)?;
		let config: Self = serde_yaml::from_str(&content)?;
		config.validate()?;
		Ok(config)
	}

	/// Validate start-up invariants. Failure here is fatal.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.tool_name_separator.is_empty() {
			return Err(ConfigError::Invalid(
				"toolNameSeparator must not be empty".to_string(),
			));
		}
		if self.catalog_refresh_interval.is_zero() {
			return Err(ConfigError::Invalid(
				"catalogRefreshInterval must be positive".to_string(),
			));
		}
		if self.max_concurrent_probes == 0 {
			return Err(ConfigError::Invalid(
				"maxConcurrentProbes must be positive".to_string(),
			));
		}

		CompiledPattern::compile_all(self.allowed_tool_patterns.iter().map(String::as_str))?;
		CompiledPattern::compile_all(self.denied_tool_patterns.iter().map(String::as_str))?;

		let mut names = std::collections::HashSet::new();
		let mut prefixes = std::collections::HashSet::new();
		for upstream in &self.upstreams {
			upstream.validate()?;
			if !upstream.enabled {
				continue;
			}
			if !names.insert(upstream.name.as_str()) {
				return Err(ConfigError::Invalid(format!(
					"duplicate upstream name '{}'",
					upstream.name
				)));
			}
			if !prefixes.insert(upstream.namespace_prefix.as_str()) {
				return Err(ConfigError::Invalid(format!(
					"duplicate namespace prefix '{}'",
					upstream.namespace_prefix
				)));
			}
		}

		for root in &self.discovery.manifest_roots {
			let url = Url::parse(root).map_err(|e| {
				ConfigError::Invalid(format!("discovery root '{root}': {e}"))
			})?;
			if url.scheme() != "http" && url.scheme() != "https" {
				return Err(ConfigError::Invalid(format!(
					"discovery root '{root}' must be http or https"
				)));
			}
		}
		if self.discovery.poll_interval.is_zero() {
			return Err(ConfigError::Invalid(
				"discovery.pollInterval must be positive".to_string(),
			));
		}

		self.rate_limit.validate()?;
		Ok(())
	}
}

impl UpstreamConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.name.is_empty() {
			return Err(ConfigError::Invalid(
				"upstream name must not be empty".to_string(),
			));
		}
		let url = Url::parse(&self.endpoint).map_err(|e| {
			ConfigError::Invalid(format!("upstream '{}': invalid endpoint: {e}", self.name))
		})?;
		if url.scheme() != "http" && url.scheme() != "https" {
			return Err(ConfigError::Invalid(format!(
				"upstream '{}': endpoint must be http or https",
				self.name
			)));
		}
		validate_prefix(&self.namespace_prefix).map_err(|e| {
			ConfigError::Invalid(format!("upstream '{}': {e}", self.name))
		})?;
		if self.request_timeout.is_zero() {
			return Err(ConfigError::Invalid(format!(
				"upstream '{}': requestTimeout must be positive",
				self.name
			)));
		}
		Ok(())
	}
}

impl RateLimitConfig {
	fn validate(&self) -> Result<(), ConfigError> {
		if !self.enabled {
			return Ok(());
		}
		let default = self.default_quota_policy.as_ref().ok_or_else(|| {
			ConfigError::Invalid(
				"rateLimit.defaultQuotaPolicy is required when rate limiting is enabled".to_string(),
			)
		})?;
		default.validate().map_err(ConfigError::Invalid)?;
		for (pattern, policy) in &self.overrides {
			CompiledPattern::compile(pattern)?;
			policy.validate().map_err(ConfigError::Invalid)?;
		}
		if self.max_cache_size == 0 {
			return Err(ConfigError::Invalid(
				"rateLimit.maxCacheSize must be positive".to_string(),
			));
		}
		Ok(())
	}
}

/// Parse a duration string like "5m", "30s", "100ms".
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ConfigError::InvalidDuration(s.to_string()));
	}

	let (num_str, unit) = if s.ends_with("ms") {
		(&s[..s.len() - 2], "ms")
	} else if s.ends_with('s') {
		(&s[..s.len() - 1], "s")
	} else if s.ends_with('m') {
		(&s[..s.len() - 1], "m")
	} else if s.ends_with('h') {
		(&s[..s.len() - 1], "h")
	} else {
		// Assume seconds if no unit.
		(s, "s")
	};

	let num: u64 = num_str
		.parse()
		.map_err(|_| ConfigError::InvalidDuration(s.to_string()))?;

	Ok(match unit {
		"ms" => Duration::from_millis(num),
		"s" => Duration::from_secs(num),
		"m" => Duration::from_secs(num * 60),
		"h" => Duration::from_secs(num * 60 * 60),
		_ => unreachable!("unit set above"),
	})
}

fn format_duration(d: &Duration) -> String {
	if d.subsec_millis() != 0 {
		format!("{}ms", d.as_millis())
	} else {
		format!("{}s", d.as_secs())
	}
}

pub(crate) mod duration_str {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&super::format_duration(d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		super::parse_duration(&raw).map_err(serde::de::Error::custom)
	}
}

pub(crate) mod duration_opt_str {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => s.serialize_some(&super::format_duration(d)),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
		let raw: Option<String> = Option::deserialize(d)?;
		raw.map(|r| super::parse_duration(&r).map_err(serde::de::Error::custom))
			.transpose()
	}
}
