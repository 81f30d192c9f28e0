// Tool dispatch: the orchestration of one `tools/call` invocation.
//
// Resolution order: policy gate, quota gate, snapshot route lookup, upstream
// health, registry config, then the audited, resilient forward. Every
// operational failure is recovered into a typed response envelope; the only
// `Err` this module returns is the caller-bug case of an empty tool name.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::audit::{AuditEnd, AuditRecorder, AuditStart, describe_arguments};
use crate::catalog::CatalogSnapshot;
use crate::client::McpClient;
use crate::identity::RequestIdentity;
use crate::jsonrpc::{CallToolResult, JsonRpcRequest};
use crate::policy::ToolPolicy;
use crate::ratelimit::{Decision, RateLimiter};
use crate::registry::UpstreamRegistry;
use crate::resiliency::{ResiliencyContext, ResiliencyError, ResiliencyPolicy, TransportError};

/// Error kind strings surfaced in response envelopes.
pub mod error_type {
	pub const TOOL_NOT_ALLOWED: &str = "ToolNotAllowed";
	pub const TOOL_NOT_FOUND: &str = "ToolNotFound";
	pub const UPSTREAM_UNAVAILABLE: &str = "UpstreamUnavailable";
	pub const CONFIGURATION_ERROR: &str = "ConfigurationError";
	pub const RESILIENCY_FAILURE: &str = "ResiliencyFailure";
	pub const CANCELLED: &str = "Cancelled";
	pub const TIMEOUT: &str = "Timeout";
	pub const PARSE_ERROR: &str = "ParseError";
	pub const TOOL_EXECUTION_ERROR: &str = "ToolExecutionError";
	pub const RATE_LIMITED: &str = "RateLimited";
}

/// Synthetic upstream names for failures that never reached a real one.
const UPSTREAM_POLICY_BLOCK: &str = "policy-block";
const UPSTREAM_RATE_LIMIT: &str = "rate-limit";
const UPSTREAM_UNKNOWN: &str = "unknown";

/// Caller bugs; raised synchronously instead of being wrapped into a
/// response envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
	#[error("external tool name must not be empty")]
	EmptyToolName,
}

/// The shaped reply every dispatch produces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolCallResponse {
	pub content: Vec<Value>,
	pub is_error: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_type: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	pub upstream: String,
	pub invocation_id: String,
	pub correlation_id: String,
	pub duration_ms: u64,
}

pub struct ToolDispatcher {
	registry: Arc<UpstreamRegistry>,
	policy: Option<Arc<ToolPolicy>>,
	limiter: Option<Arc<RateLimiter>>,
	audit: Option<Arc<dyn AuditRecorder>>,
	client: McpClient,
	resiliency: ResiliencyPolicy,
}

/// Per-invocation bookkeeping shared by the success and failure paths.
struct Invocation {
	invocation_id: String,
	correlation_id: String,
	external_tool: String,
	started: Instant,
}

impl ToolDispatcher {
	pub fn new(
		registry: Arc<UpstreamRegistry>,
		policy: Option<Arc<ToolPolicy>>,
		limiter: Option<Arc<RateLimiter>>,
		audit: Option<Arc<dyn AuditRecorder>>,
		client: McpClient,
		resiliency: ResiliencyPolicy,
	) -> Self {
		Self {
			registry,
			policy,
			limiter,
			audit,
			client,
			resiliency,
		}
	}

	/// Dispatch one tool call against the given snapshot. The identity
	/// carries the caller's tenant/user for quota keying and the correlation
	/// id to propagate.
	pub async fn call_tool(
		&self,
		external_tool: &str,
		arguments: Option<Map<String, Value>>,
		snapshot: &CatalogSnapshot,
		identity: &RequestIdentity,
		cancel: &CancellationToken,
	) -> Result<McpToolCallResponse, DispatchError> {
		if external_tool.is_empty() {
			return Err(DispatchError::EmptyToolName);
		}

		let invocation = Invocation {
			invocation_id: Uuid::new_v4().to_string(),
			correlation_id: identity.correlation_id.clone(),
			external_tool: external_tool.to_string(),
			started: Instant::now(),
		};

		let (args_size, args_hash) = match &arguments {
			Some(args) => {
				let (size, hash) = describe_arguments(args);
				(Some(size), Some(hash))
			},
			None => (None, None),
		};
		self.audit_start(&invocation, UPSTREAM_UNKNOWN, args_size, args_hash);

		// Policy gate.
		if let Some(policy) = &self.policy
			&& !policy.is_allowed(external_tool)
		{
			return Ok(self.fail(
				&invocation,
				UPSTREAM_POLICY_BLOCK,
				error_type::TOOL_NOT_ALLOWED,
				format!("tool '{external_tool}' is blocked by policy"),
				Vec::new(),
			));
		}

		// Quota gate. Runs after the policy gate, so denied tools never
		// consume the caller's budget.
		if let Some(limiter) = &self.limiter
			&& let Decision::Limited {
				scope,
				permit_limit,
				window_millis,
			} = limiter.check(identity, external_tool)
		{
			return Ok(self.fail(
				&invocation,
				UPSTREAM_RATE_LIMIT,
				error_type::RATE_LIMITED,
				format!("quota exceeded for {scope:?}: {permit_limit} calls per {window_millis}ms"),
				Vec::new(),
			));
		}

		// Route lookup.
		let Some(route) = snapshot.get(external_tool) else {
			return Ok(self.fail(
				&invocation,
				UPSTREAM_UNKNOWN,
				error_type::TOOL_NOT_FOUND,
				format!("tool '{external_tool}' is not in the catalog"),
				Vec::new(),
			));
		};

		// Health gate: a known route to a dead upstream fails fast.
		if !snapshot.is_upstream_healthy(&route.upstream_name) {
			return Ok(self.fail(
				&invocation,
				&route.upstream_name,
				error_type::UPSTREAM_UNAVAILABLE,
				format!("upstream '{}' is unhealthy", route.upstream_name),
				Vec::new(),
			));
		}

		// The registry may have moved on since the snapshot was built.
		let Some(upstream) = self.registry.get(&route.upstream_name) else {
			return Ok(self.fail(
				&invocation,
				&route.upstream_name,
				error_type::CONFIGURATION_ERROR,
				format!("upstream '{}' is not configured", route.upstream_name),
				Vec::new(),
			));
		};

		let request = JsonRpcRequest::call_tool(
			Uuid::new_v4().to_string(),
			&route.upstream_tool,
			arguments.unwrap_or_default(),
		);
		let resiliency_ctx = ResiliencyContext::new(
			&invocation.external_tool,
			&upstream.name,
			upstream.rpc_url(),
			&invocation.correlation_id,
			&invocation.invocation_id,
		);

		debug!(
			target: "dispatch",
			tool = %invocation.external_tool,
			upstream = %upstream.name,
			invocation_id = %invocation.invocation_id,
			"forwarding tool call"
		);

		let client = &self.client;
		let upstream_ref = &upstream;
		let request_ref = &request;
		let correlation = invocation.correlation_id.clone();
		let correlation_ref = &correlation;
		let outcome = self
			.resiliency
			.execute(&resiliency_ctx, cancel, move |_attempt| async move {
				client.call(upstream_ref, request_ref, correlation_ref).await
			})
			.await;

		let response = match outcome {
			Ok(response) => response,
			Err(e) => return Ok(self.forward_failure(&invocation, &upstream.name, e)),
		};

		// A JSON-RPC error member passes its numeric code through verbatim.
		if let Some(error) = response.error {
			return Ok(self.fail(
				&invocation,
				&upstream.name,
				&error.code.to_string(),
				error.message,
				Vec::new(),
			));
		}

		let Some(result) = response.result else {
			return Ok(self.fail(
				&invocation,
				&upstream.name,
				error_type::PARSE_ERROR,
				"response carried neither result nor error".to_string(),
				Vec::new(),
			));
		};

		let call_result: CallToolResult = match serde_json::from_value(result) {
			Ok(call_result) => call_result,
			Err(e) => {
				return Ok(self.fail(
					&invocation,
					&upstream.name,
					error_type::PARSE_ERROR,
					format!("malformed tool result: {e}"),
					Vec::new(),
				));
			},
		};

		if call_result.is_error {
			let message = first_text_content(&call_result.content)
				.unwrap_or_else(|| "tool reported an execution error".to_string());
			return Ok(self.fail(
				&invocation,
				&upstream.name,
				error_type::TOOL_EXECUTION_ERROR,
				message,
				call_result.content,
			));
		}

		Ok(self.succeed(&invocation, &upstream.name, call_result.content))
	}

	fn forward_failure(
		&self,
		invocation: &Invocation,
		upstream: &str,
		error: ResiliencyError,
	) -> McpToolCallResponse {
		let (error_type, message) = match &error {
			ResiliencyError::Cancelled => {
				(error_type::CANCELLED, "the caller cancelled the call".to_string())
			},
			ResiliencyError::Exhausted {
				source: TransportError::Timeout(timeout),
				..
			} => (
				error_type::TIMEOUT,
				format!("upstream did not answer within {timeout:?}"),
			),
			ResiliencyError::Exhausted { attempts, source } => (
				error_type::RESILIENCY_FAILURE,
				format!("all {attempts} attempts failed: {source}"),
			),
			ResiliencyError::Fatal(TransportError::Malformed(detail)) => {
				(error_type::PARSE_ERROR, detail.clone())
			},
			ResiliencyError::Fatal(source) => {
				(error_type::RESILIENCY_FAILURE, source.to_string())
			},
		};
		self.fail(invocation, upstream, error_type, message, Vec::new())
	}

	fn succeed(
		&self,
		invocation: &Invocation,
		upstream: &str,
		content: Vec<Value>,
	) -> McpToolCallResponse {
		let duration_ms = invocation.started.elapsed().as_millis() as u64;
		self.audit_end(invocation, upstream, true, duration_ms, None, None);
		McpToolCallResponse {
			content,
			is_error: false,
			error_type: None,
			error_message: None,
			upstream: upstream.to_string(),
			invocation_id: invocation.invocation_id.clone(),
			correlation_id: invocation.correlation_id.clone(),
			duration_ms,
		}
	}

	fn fail(
		&self,
		invocation: &Invocation,
		upstream: &str,
		error_type: &str,
		error_message: String,
		content: Vec<Value>,
	) -> McpToolCallResponse {
		let duration_ms = invocation.started.elapsed().as_millis() as u64;
		self.audit_end(
			invocation,
			upstream,
			false,
			duration_ms,
			Some(error_type),
			Some(&error_message),
		);
		McpToolCallResponse {
			content,
			is_error: true,
			error_type: Some(error_type.to_string()),
			error_message: Some(error_message),
			upstream: upstream.to_string(),
			invocation_id: invocation.invocation_id.clone(),
			correlation_id: invocation.correlation_id.clone(),
			duration_ms,
		}
	}

	fn audit_start(
		&self,
		invocation: &Invocation,
		upstream: &str,
		args_size: Option<usize>,
		args_hash: Option<String>,
	) {
		if let Some(audit) = &self.audit {
			audit.record_start(&AuditStart {
				invocation_id: invocation.invocation_id.clone(),
				external_tool: invocation.external_tool.clone(),
				upstream: upstream.to_string(),
				correlation_id: invocation.correlation_id.clone(),
				args_size,
				args_hash,
			});
		}
	}

	fn audit_end(
		&self,
		invocation: &Invocation,
		upstream: &str,
		success: bool,
		duration_ms: u64,
		error_type: Option<&str>,
		error_message: Option<&str>,
	) {
		if let Some(audit) = &self.audit {
			audit.record_end(&AuditEnd {
				invocation_id: invocation.invocation_id.clone(),
				external_tool: invocation.external_tool.clone(),
				upstream: upstream.to_string(),
				correlation_id: invocation.correlation_id.clone(),
				success,
				duration_ms,
				error_type: error_type.map(str::to_string),
				error_message: error_message.map(str::to_string),
			});
		}
	}
}

fn first_text_content(content: &[Value]) -> Option<String> {
	content.iter().find_map(|item| {
		item.get("text")
			.and_then(Value::as_str)
			.map(str::to_string)
	})
}
