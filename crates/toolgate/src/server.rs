// The MCP HTTP endpoint.
//
// One JSON-RPC handler backs both `POST /mcp` and `POST /mcp/v1`. Protocol
// errors use JSON-RPC error codes; operational tool failures come back as a
// `tools/call` result with `isError: true`. Rate limiting applies to
// `tools/call` only and surfaces as HTTP 429. The gateway also serves its
// own well-known manifest and a health summary.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::audit::TracingAuditRecorder;
use crate::catalog::{CatalogAggregator, CatalogOptions};
use crate::client::{HttpClientFactory, McpClient};
use crate::config::{ConfigError, GatewayConfig, ServerInfoConfig, TenantResolutionConfig};
use crate::dispatch::{DispatchError, ToolDispatcher, error_type};
use crate::health::HealthProbe;
use crate::identity::RequestIdentity;
use crate::jsonrpc::{
	CallToolParams, CallToolResult, InitializeResult, JsonRpcRequest, JsonRpcResponse,
	ListToolsResult, ServerCapabilities, ServerInfo, code, method,
};
use crate::naming::ToolNameService;
use crate::policy::ToolPolicy;
use crate::ratelimit::RateLimiter;
use crate::registry::{ServiceManifest, UpstreamRegistry};
use crate::resiliency::ResiliencyPolicy;

/// MCP protocol revision the gateway advertises.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub struct GatewayState {
	pub dispatcher: ToolDispatcher,
	pub aggregator: Arc<CatalogAggregator>,
	pub limiter: Arc<RateLimiter>,
	pub policy: Arc<ToolPolicy>,
	pub tenant_resolution: TenantResolutionConfig,
	pub server_info: ServerInfoConfig,
	pub manifest: ServiceManifest,
	/// Well-known path (relative, no leading slash) the manifest is served
	/// under.
	pub manifest_path: String,
	/// Process-wide shutdown token; in-flight requests derive from it.
	pub shutdown: CancellationToken,
}

/// The manifest the gateway serves about itself.
pub fn gateway_manifest(config: &GatewayConfig) -> ServiceManifest {
	ServiceManifest {
		service_name: Some(config.server_info.name.clone()),
		mcp_http_endpoint: Some(format!("http://{}/mcp/v1", config.listen)),
		namespace_prefix: None,
		version: Some(config.server_info.version.clone()),
		description: Some(
			"Gateway aggregating upstream MCP tool servers into one namespaced catalog".to_string(),
		),
		tags: Vec::new(),
		request_timeout_seconds: None,
	}
}

pub fn router(state: Arc<GatewayState>) -> Router {
	let manifest_route = format!("/.well-known/{}", state.manifest_path_for_route());
	Router::new()
		.route("/mcp", post(handle_mcp))
		.route("/mcp/v1", post(handle_mcp))
		.route(&manifest_route, get(handle_manifest))
		.route("/healthz", get(handle_healthz))
		.with_state(state)
}

impl GatewayState {
	/// Wire the full gateway from configuration with a statically configured
	/// registry. Use `with_registry` to plug in a discovery-provider-backed
	/// one instead.
	pub fn from_config(
		config: &GatewayConfig,
		shutdown: CancellationToken,
	) -> Result<Arc<Self>, ConfigError> {
		let registry = Arc::new(UpstreamRegistry::from_static(&config.upstreams));
		Self::with_registry(config, registry, shutdown)
	}

	pub fn with_registry(
		config: &GatewayConfig,
		registry: Arc<UpstreamRegistry>,
		shutdown: CancellationToken,
	) -> Result<Arc<Self>, ConfigError> {
		let factory = HttpClientFactory::default();
		let client = McpClient::new(factory.clone());

		let naming = ToolNameService::new(&config.tool_name_separator)
			.map_err(|e| ConfigError::Invalid(e.to_string()))?;
		let aggregator = Arc::new(CatalogAggregator::new(
			Arc::clone(&registry),
			client.clone(),
			HealthProbe::new(factory, &config.manifest_path),
			naming,
			CatalogOptions {
				freshness: config.catalog_freshness,
				max_concurrent_probes: config.max_concurrent_probes,
				preserve_tools_on_failure: config.preserve_tools_on_failure,
			},
		));

		let policy = Arc::new(ToolPolicy::new(
			config.allowed_tool_patterns.iter().map(String::as_str),
			config.denied_tool_patterns.iter().map(String::as_str),
			config.deny_by_default,
		)?);
		let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit)?);

		let resiliency = if config.retry.attempts > 1 {
			ResiliencyPolicy::retrying(
				config.retry.attempts,
				config.retry.backoff.into_iter().collect(),
			)
		} else {
			ResiliencyPolicy::no_retry()
		};

		let dispatcher = ToolDispatcher::new(
			registry,
			Some(Arc::clone(&policy)),
			Some(Arc::clone(&limiter)),
			Some(Arc::new(TracingAuditRecorder)),
			client,
			resiliency,
		);

		Ok(Arc::new(Self {
			dispatcher,
			aggregator,
			limiter,
			policy,
			tenant_resolution: config.tenant_resolution.clone(),
			server_info: config.server_info.clone(),
			manifest: gateway_manifest(config),
			manifest_path: config.manifest_path.clone(),
			shutdown,
		}))
	}

	fn manifest_path_for_route(&self) -> String {
		self.manifest_path.trim_start_matches('/').to_string()
	}
}

async fn handle_mcp(
	State(state): State<Arc<GatewayState>>,
	headers: HeaderMap,
	Json(body): Json<Value>,
) -> Response {
	let identity = RequestIdentity::from_headers(&headers, &state.tenant_resolution);

	let request: JsonRpcRequest = match serde_json::from_value(body) {
		Ok(request) => request,
		Err(e) => {
			return rpc_error(
				Value::Null,
				code::INVALID_REQUEST,
				format!("malformed JSON-RPC request: {e}"),
			);
		},
	};
	let id = request.id_or_null();

	if !request.is_supported_version() {
		return rpc_error(
			id,
			code::INVALID_REQUEST,
			format!("unsupported JSON-RPC version '{}'", request.jsonrpc),
		);
	}

	match request.method.as_str() {
		method::INITIALIZE => handle_initialize(&state, id),
		method::TOOLS_LIST => handle_tools_list(&state, id).await,
		method::TOOLS_CALL => handle_tools_call(&state, identity, id, request.params).await,
		other => rpc_error(
			id,
			code::METHOD_NOT_FOUND,
			format!("method '{other}' is not supported"),
		),
	}
}

fn handle_initialize(state: &GatewayState, id: Value) -> Response {
	let result = InitializeResult {
		protocol_version: MCP_PROTOCOL_VERSION.to_string(),
		server_info: ServerInfo {
			name: state.server_info.name.clone(),
			version: state.server_info.version.clone(),
		},
		capabilities: ServerCapabilities::default(),
	};
	rpc_result(id, &result)
}

async fn handle_tools_list(state: &GatewayState, id: Value) -> Response {
	let cancel = state.shutdown.child_token();
	let snapshot = match state.aggregator.ensure_fresh_snapshot(&cancel).await {
		Ok(snapshot) => snapshot,
		Err(e) => {
			return rpc_error(id, code::INTERNAL_ERROR, format!("catalog unavailable: {e}"));
		},
	};

	let tools = snapshot
		.tool_entries()
		.into_iter()
		.filter(|entry| state.policy.is_allowed(&entry.name))
		.collect();
	rpc_result(id, &ListToolsResult { tools })
}

async fn handle_tools_call(
	state: &GatewayState,
	identity: RequestIdentity,
	id: Value,
	params: Option<Value>,
) -> Response {
	let params = match params {
		Some(params) if !params.is_null() => params,
		_ => return rpc_error(id, code::INVALID_PARAMS, "params object is required"),
	};
	let params: CallToolParams = match serde_json::from_value(params) {
		Ok(params) => params,
		Err(e) => {
			return rpc_error(id, code::INVALID_PARAMS, format!("invalid tools/call params: {e}"));
		},
	};
	if params.name.is_empty() {
		return rpc_error(id, code::INVALID_PARAMS, "tool name must not be empty");
	}

	let cancel = state.shutdown.child_token();
	let snapshot = match state.aggregator.ensure_fresh_snapshot(&cancel).await {
		Ok(snapshot) => snapshot,
		Err(e) => {
			return rpc_error(id, code::INTERNAL_ERROR, format!("catalog unavailable: {e}"));
		},
	};

	// The dispatcher runs the policy and quota gates in order; only
	// tools/call goes through it, so initialize and tools/list bypass
	// rate limiting.
	let outcome = state
		.dispatcher
		.call_tool(&params.name, params.arguments, &snapshot, &identity, &cancel)
		.await;

	let envelope = match outcome {
		Ok(envelope) => envelope,
		Err(DispatchError::EmptyToolName) => {
			return rpc_error(id, code::INVALID_PARAMS, "tool name must not be empty");
		},
	};

	// A snapshot miss is a params-level error at the protocol layer.
	if envelope.error_type.as_deref() == Some(error_type::TOOL_NOT_FOUND) {
		return rpc_error(
			id,
			code::INVALID_PARAMS,
			envelope
				.error_message
				.unwrap_or_else(|| "tool not found".to_string()),
		);
	}

	// Quota rejections keep the envelope shape but ride on HTTP 429.
	let status = if envelope.error_type.as_deref() == Some(error_type::RATE_LIMITED) {
		StatusCode::TOO_MANY_REQUESTS
	} else {
		StatusCode::OK
	};

	let content = if envelope.is_error && envelope.content.is_empty() {
		let text = envelope
			.error_message
			.clone()
			.unwrap_or_else(|| "tool call failed".to_string());
		let text = match &envelope.error_type {
			Some(kind) => format!("{kind}: {text}"),
			None => text,
		};
		vec![json!({"type": "text", "text": text})]
	} else {
		envelope.content
	};

	rpc_result_with_status(
		status,
		id,
		&CallToolResult {
			content,
			is_error: envelope.is_error,
		},
	)
}

async fn handle_manifest(State(state): State<Arc<GatewayState>>) -> Response {
	Json(state.manifest.clone()).into_response()
}

async fn handle_healthz(State(state): State<Arc<GatewayState>>) -> Response {
	let snapshot = state.aggregator.snapshot();
	let healthy = snapshot
		.upstream_health
		.values()
		.filter(|healthy| **healthy)
		.count();
	Json(json!({
		"status": "ok",
		"catalogVersion": snapshot.source_version,
		"tools": snapshot.tools_by_external_name.len(),
		"upstreams": {
			"healthy": healthy,
			"total": snapshot.upstream_health.len(),
		},
	}))
	.into_response()
}

fn rpc_result<T: serde::Serialize>(id: Value, result: &T) -> Response {
	rpc_result_with_status(StatusCode::OK, id, result)
}

fn rpc_result_with_status<T: serde::Serialize>(status: StatusCode, id: Value, result: &T) -> Response {
	match serde_json::to_value(result) {
		Ok(value) => (status, Json(JsonRpcResponse::result(id, value))).into_response(),
		Err(e) => rpc_error(id, code::INTERNAL_ERROR, format!("serialization failed: {e}")),
	}
}

fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Response {
	Json(JsonRpcResponse::error(id, code, message)).into_response()
}
