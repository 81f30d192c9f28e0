// Two-tier upstream liveness probe.
//
// Tier one fetches the well-known manifest at the service root; any 2xx means
// the service is up. Tier two falls back to a minimal JSON-RPC `tools/list`
// and validates that the reply carries a `result.tools` array. The probe
// races the upstream's request timeout against both tiers combined; a
// timeout is an unhealthy result, not an error. Caller cancellation
// propagates.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{HttpClientFactory, outbound_headers};
use crate::jsonrpc::JsonRpcRequest;
use crate::registry::Upstream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStrategy {
	Manifest,
	ToolsList,
}

impl ProbeStrategy {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Manifest => "manifest",
			Self::ToolsList => "tools-list",
		}
	}
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
	pub healthy: bool,
	/// Zero when unhealthy.
	pub latency: Duration,
	/// The strategy that succeeded, or the one being attempted when the
	/// probe failed.
	pub strategy: ProbeStrategy,
	pub error_message: Option<String>,
}

impl ProbeResult {
	fn healthy(latency: Duration, strategy: ProbeStrategy) -> Self {
		Self {
			healthy: true,
			latency,
			strategy,
			error_message: None,
		}
	}

	fn unhealthy(strategy: ProbeStrategy, message: impl Into<String>) -> Self {
		Self {
			healthy: false,
			latency: Duration::ZERO,
			strategy,
			error_message: Some(message.into()),
		}
	}
}

#[derive(Debug, Error)]
pub enum ProbeError {
	#[error("probe cancelled")]
	Cancelled,
}

pub struct HealthProbe {
	factory: HttpClientFactory,
	manifest_path: String,
}

impl HealthProbe {
	pub fn new(factory: HttpClientFactory, manifest_path: impl Into<String>) -> Self {
		Self {
			factory,
			manifest_path: manifest_path.into(),
		}
	}

	/// Probe the upstream. Errors only on caller cancellation; every other
	/// outcome (including timeout) is a `ProbeResult`.
	pub async fn probe(
		&self,
		upstream: &Upstream,
		cancel: &CancellationToken,
	) -> Result<ProbeResult, ProbeError> {
		// Which tier the probe is in, so a timeout can report the strategy
		// it interrupted.
		let attempted = AtomicU8::new(0);

		let outcome = tokio::select! {
			biased;
			_ = cancel.cancelled() => return Err(ProbeError::Cancelled),
			outcome = tokio::time::timeout(
				upstream.request_timeout,
				self.probe_tiers(upstream, &attempted),
			) => outcome,
		};

		Ok(match outcome {
			Ok(result) => result,
			Err(_elapsed) => {
				let strategy = if attempted.load(Ordering::Relaxed) == 0 {
					ProbeStrategy::Manifest
				} else {
					ProbeStrategy::ToolsList
				};
				ProbeResult::unhealthy(
					strategy,
					format!("probe timed out after {:?}", upstream.request_timeout),
				)
			},
		})
	}

	async fn probe_tiers(&self, upstream: &Upstream, attempted: &AtomicU8) -> ProbeResult {
		let client = self.factory.client_for(upstream.endpoint.as_str());
		let headers = outbound_headers(upstream, &Uuid::new_v4().to_string());
		let start = Instant::now();

		// Tier 1: manifest at the service root.
		let manifest_url = upstream.manifest_url(&self.manifest_path);
		match client.get(&manifest_url).headers(headers.clone()).send().await {
			Ok(response) if response.status().is_success() => {
				return ProbeResult::healthy(start.elapsed(), ProbeStrategy::Manifest);
			},
			Ok(response) => {
				tracing::debug!(
					target: "health",
					upstream = %upstream.name,
					status = response.status().as_u16(),
					"manifest probe failed, falling back to tools/list"
				);
			},
			Err(e) => {
				tracing::debug!(
					target: "health",
					upstream = %upstream.name,
					error = %e,
					"manifest probe failed, falling back to tools/list"
				);
			},
		}

		// Tier 2: minimal JSON-RPC tools/list.
		attempted.store(1, Ordering::Relaxed);
		let request = JsonRpcRequest::list_tools(Uuid::new_v4().to_string());
		let response = match client
			.post(upstream.rpc_url())
			.headers(headers)
			.json(&request)
			.send()
			.await
		{
			Ok(response) => response,
			Err(e) => {
				return ProbeResult::unhealthy(
					ProbeStrategy::ToolsList,
					format!("tools/list request failed: {e}"),
				);
			},
		};

		let status = response.status();
		if !status.is_success() {
			return ProbeResult::unhealthy(
				ProbeStrategy::ToolsList,
				format!("tools/list returned HTTP {status}"),
			);
		}

		let body: Value = match response.json().await {
			Ok(body) => body,
			Err(e) => {
				return ProbeResult::unhealthy(
					ProbeStrategy::ToolsList,
					format!("tools/list body was not JSON: {e}"),
				);
			},
		};

		// The array may be empty; it just has to be there.
		let has_tools_array = body
			.get("result")
			.and_then(|r| r.get("tools"))
			.is_some_and(Value::is_array);
		if has_tools_array {
			ProbeResult::healthy(start.elapsed(), ProbeStrategy::ToolsList)
		} else {
			ProbeResult::unhealthy(
				ProbeStrategy::ToolsList,
				"tools/list response lacked a result.tools array",
			)
		}
	}
}
