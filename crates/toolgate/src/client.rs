// Outbound JSON-RPC transport.
//
// HTTP clients are pooled by endpoint through `HttpClientFactory`; nothing
// else in the crate constructs a `reqwest::Client`. Each request applies the
// upstream's default headers (without overriding gateway-set ones), forwards
// the correlation id, and races the upstream's request timeout.

use std::str::FromStr;
use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use uuid::Uuid;

use crate::cache::LruCache;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, ListToolsResult, ToolEntry};
use crate::registry::Upstream;
use crate::resiliency::TransportError;

/// Header used to propagate correlation ids end to end.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// The only allowed creator of HTTP clients, pooled by endpoint.
#[derive(Clone)]
pub struct HttpClientFactory {
	clients: Arc<LruCache<String, reqwest::Client>>,
}

impl HttpClientFactory {
	pub fn new(max_clients: usize) -> Self {
		Self {
			clients: Arc::new(LruCache::new(max_clients)),
		}
	}

	/// A pooled client for the endpoint. `reqwest::Client` is internally
	/// reference-counted, so clones share the connection pool.
	pub fn client_for(&self, endpoint: &str) -> reqwest::Client {
		self.clients
			.get_or_add(endpoint.to_string(), reqwest::Client::new)
	}
}

impl Default for HttpClientFactory {
	fn default() -> Self {
		Self::new(64)
	}
}

/// JSON-RPC client for upstream MCP servers.
#[derive(Clone)]
pub struct McpClient {
	factory: HttpClientFactory,
}

impl McpClient {
	pub fn new(factory: HttpClientFactory) -> Self {
		Self { factory }
	}

	pub fn factory(&self) -> &HttpClientFactory {
		&self.factory
	}

	/// POST a JSON-RPC request to the upstream's rpc endpoint. The
	/// upstream's request timeout is raced against the send; callers that
	/// need caller-cancellation race this future themselves and drop it,
	/// which aborts the in-flight request.
	pub async fn call(
		&self,
		upstream: &Upstream,
		request: &JsonRpcRequest,
		correlation_id: &str,
	) -> Result<JsonRpcResponse, TransportError> {
		let url = upstream.rpc_url();
		let client = self.factory.client_for(upstream.endpoint.as_str());
		let headers = outbound_headers(upstream, correlation_id);

		let send = async {
			let response = client
				.post(&url)
				.headers(headers)
				.json(request)
				.send()
				.await
				.map_err(|e| TransportError::Connect(e.to_string()))?;

			let status = response.status();
			if !status.is_success() {
				return Err(TransportError::Status(status.as_u16()));
			}

			response
				.json::<JsonRpcResponse>()
				.await
				.map_err(|e| TransportError::Malformed(e.to_string()))
		};

		tokio::select! {
			result = send => result,
			_ = tokio::time::sleep(upstream.request_timeout) => {
				Err(TransportError::Timeout(upstream.request_timeout))
			},
		}
	}

	/// Fetch the upstream's advertised tool list.
	pub async fn list_tools(
		&self,
		upstream: &Upstream,
		correlation_id: &str,
	) -> Result<Vec<ToolEntry>, TransportError> {
		let request = JsonRpcRequest::list_tools(Uuid::new_v4().to_string());
		let response = self.call(upstream, &request, correlation_id).await?;

		if let Some(error) = response.error {
			return Err(TransportError::Malformed(format!(
				"tools/list failed: {} (code {})",
				error.message, error.code
			)));
		}
		let result: Value = response.result.ok_or_else(|| {
			TransportError::Malformed("tools/list response had no result".to_string())
		})?;
		let list: ListToolsResult = serde_json::from_value(result)
			.map_err(|e| TransportError::Malformed(format!("invalid tools/list result: {e}")))?;
		Ok(list.tools)
	}
}

/// Correlation header plus the upstream's default headers; defaults never
/// override a header the gateway already set.
pub(crate) fn outbound_headers(upstream: &Upstream, correlation_id: &str) -> HeaderMap {
	let mut headers = HeaderMap::new();
	if let Ok(value) = HeaderValue::from_str(correlation_id) {
		headers.insert(HeaderName::from_static(CORRELATION_HEADER), value);
	}
	for (name, value) in &upstream.default_headers {
		let Ok(name) = HeaderName::from_str(name) else {
			tracing::warn!(target: "client", upstream = %upstream.name, header = %name, "skipping invalid default header name");
			continue;
		};
		let Ok(value) = HeaderValue::from_str(value) else {
			tracing::warn!(target: "client", upstream = %upstream.name, header = %name, "skipping invalid default header value");
			continue;
		};
		if !headers.contains_key(&name) {
			headers.insert(name, value);
		}
	}
	headers
}
