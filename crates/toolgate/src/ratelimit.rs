// Multi-scope sliding-window quota evaluation.
//
// Each `tools/call` is classified by a quota policy (wildcard overrides
// first, then the default) and counted in a bucket keyed by the policy's
// scope. Buckets are a fixed-window approximation of a sliding window: the
// counter resets when the window index advances, increments atomically, and
// rejects once it exceeds the permit budget. Buckets live in the bounded
// cache and expire after an idle period enforced by a periodic cleanup task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::LruCache;
use crate::config::{ConfigError, RateLimitConfig};
use crate::identity::RequestIdentity;
use crate::patterns::CompiledPattern;

/// Key family used to partition quota buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuotaScope {
	Global,
	Tenant,
	User,
	Tool,
	TenantTool,
	UserTool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaPolicy {
	pub scope: QuotaScope,
	pub permit_limit: u32,
	pub window_millis: u64,
	/// Accepted for forward compatibility; over-quota requests are still
	/// rejected immediately.
	#[serde(default)]
	pub queue_limit: u32,
}

impl QuotaPolicy {
	pub fn validate(&self) -> Result<(), String> {
		if self.permit_limit == 0 {
			return Err("permitLimit must be positive".to_string());
		}
		if self.window_millis == 0 {
			return Err("windowMillis must be positive".to_string());
		}
		Ok(())
	}
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
	Allowed,
	Limited {
		scope: QuotaScope,
		permit_limit: u32,
		window_millis: u64,
	},
}

struct QuotaBucket {
	window_index: AtomicU64,
	count: AtomicU64,
	last_access_millis: AtomicU64,
}

impl QuotaBucket {
	fn new(now_millis: u64) -> Self {
		Self {
			window_index: AtomicU64::new(u64::MAX),
			count: AtomicU64::new(0),
			last_access_millis: AtomicU64::new(now_millis),
		}
	}

	/// Count one request against the bucket; true when admitted. The reset
	/// race (a concurrent increment between the window swap and the counter
	/// store) can under-count by a few permits, which is the accepted
	/// approximation.
	fn admit(&self, policy: &QuotaPolicy, now_millis: u64) -> bool {
		self.last_access_millis.store(now_millis, Ordering::Relaxed);

		let window = now_millis / policy.window_millis;
		let current = self.window_index.load(Ordering::Acquire);
		if current != window
			&& self
				.window_index
				.compare_exchange(current, window, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
		{
			self.count.store(0, Ordering::Release);
		}

		let admitted = self.count.fetch_add(1, Ordering::AcqRel) + 1;
		admitted <= u64::from(policy.permit_limit)
	}
}

pub struct RateLimiter {
	enabled: bool,
	default_policy: Option<QuotaPolicy>,
	overrides: Vec<(CompiledPattern, QuotaPolicy)>,
	buckets: LruCache<String, Arc<QuotaBucket>>,
	entry_expiration: Duration,
}

impl RateLimiter {
	/// An engine that admits everything.
	pub fn disabled() -> Self {
		Self {
			enabled: false,
			default_policy: None,
			overrides: Vec::new(),
			buckets: LruCache::new(1),
			entry_expiration: Duration::ZERO,
		}
	}

	pub fn from_config(config: &RateLimitConfig) -> Result<Self, ConfigError> {
		if !config.enabled {
			return Ok(Self::disabled());
		}
		let mut overrides = Vec::with_capacity(config.overrides.len());
		for (pattern, policy) in &config.overrides {
			policy.validate().map_err(ConfigError::Invalid)?;
			overrides.push((CompiledPattern::compile(pattern)?, policy.clone()));
		}
		let default_policy = config.default_quota_policy.clone();
		if let Some(policy) = &default_policy {
			policy.validate().map_err(ConfigError::Invalid)?;
		}
		Ok(Self {
			enabled: true,
			default_policy,
			overrides,
			buckets: LruCache::new(config.max_cache_size),
			entry_expiration: config.entry_expiration,
		})
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled
	}

	/// Classify and count one `tools/call`. `initialize`, `tools/list`, and
	/// non-MCP traffic never reach this.
	pub fn check(&self, identity: &RequestIdentity, external_tool: &str) -> Decision {
		if !self.enabled {
			return Decision::Allowed;
		}
		let Some(policy) = self.policy_for(external_tool) else {
			return Decision::Allowed;
		};

		let now = now_millis();
		let key = bucket_key(policy, identity, external_tool);
		let bucket = self
			.buckets
			.get_or_add(key, || Arc::new(QuotaBucket::new(now)));

		if bucket.admit(policy, now) {
			Decision::Allowed
		} else {
			debug!(
				target: "ratelimit",
				tool = external_tool,
				tenant = %identity.tenant,
				scope = ?policy.scope,
				limit = policy.permit_limit,
				"quota exceeded"
			);
			Decision::Limited {
				scope: policy.scope,
				permit_limit: policy.permit_limit,
				window_millis: policy.window_millis,
			}
		}
	}

	/// First matching wildcard override, else the default policy.
	fn policy_for(&self, external_tool: &str) -> Option<&QuotaPolicy> {
		self.overrides
			.iter()
			.find(|(pattern, _)| pattern.matches(external_tool))
			.map(|(_, policy)| policy)
			.or(self.default_policy.as_ref())
	}

	/// Drop buckets idle for longer than the configured expiration.
	pub fn purge_idle(&self) {
		if !self.enabled {
			return;
		}
		let cutoff = now_millis().saturating_sub(self.entry_expiration.as_millis() as u64);
		self.buckets
			.retain(|_, bucket| bucket.last_access_millis.load(Ordering::Relaxed) >= cutoff);
	}

	pub fn bucket_count(&self) -> usize {
		self.buckets.len()
	}

	/// Periodic idle-bucket cleanup, stopped by the shutdown token.
	pub fn spawn_cleanup_loop(
		self: Arc<Self>,
		interval: Duration,
		shutdown: CancellationToken,
	) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = shutdown.cancelled() => break,
					_ = tokio::time::sleep(interval) => {},
				}
				let before = self.bucket_count();
				self.purge_idle();
				let after = self.bucket_count();
				let purged = before.saturating_sub(after);
				if purged > 0 {
					debug!(target: "ratelimit", purged, remaining = after, "purged idle quota buckets");
				}
			}
		})
	}
}

fn bucket_key(policy: &QuotaPolicy, identity: &RequestIdentity, tool: &str) -> String {
	match policy.scope {
		QuotaScope::Global => "global".to_string(),
		QuotaScope::Tenant => format!("tenant:{}", identity.tenant),
		QuotaScope::User => format!("user:{}", identity.user),
		QuotaScope::Tool => format!("tool:{tool}"),
		QuotaScope::TenantTool => format!("tenant-tool:{}:{tool}", identity.tenant),
		QuotaScope::UserTool => format!("user-tool:{}:{tool}", identity.user),
	}
}

fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as u64
}
