// End-to-end tests driving a real gateway over HTTP against mock upstreams.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use toolgate::config::GatewayConfig;
use toolgate::identity::RequestIdentity;
use toolgate::server::{GatewayState, router};

/// A well-behaved MCP upstream advertising the given tools and answering
/// every tools/call with a fixed text payload.
async fn mock_upstream(tools: Value, call_text: &str) -> MockServer {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/.well-known/mcp/manifest.json"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
		.mount(&server)
		.await;

	let call_text = call_text.to_string();
	Mock::given(method("POST"))
		.and(path("/mcp/v1"))
		.respond_with(move |request: &wiremock::Request| {
			let body: Value = serde_json::from_slice(&request.body).unwrap();
			match body["method"].as_str() {
				Some("tools/list") => ResponseTemplate::new(200).set_body_json(json!({
					"jsonrpc": "2.0",
					"id": body["id"],
					"result": {"tools": tools.clone()}
				})),
				Some("tools/call") => ResponseTemplate::new(200).set_body_json(json!({
					"jsonrpc": "2.0",
					"id": body["id"],
					"result": {
						"content": [{"type": "text", "text": call_text.clone()}],
						"isError": false
					}
				})),
				_ => ResponseTemplate::new(400),
			}
		})
		.mount(&server)
		.await;
	server
}

fn gateway_config(yaml: &str) -> GatewayConfig {
	let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
	config.validate().unwrap();
	config
}

/// Serve the gateway on an ephemeral port; returns its base URL.
async fn serve(config: &GatewayConfig) -> (String, CancellationToken) {
	let shutdown = CancellationToken::new();
	let state = GatewayState::from_config(config, shutdown.clone()).unwrap();
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let app = router(Arc::clone(&state));
	let serve_token = shutdown.clone();
	tokio::spawn(async move {
		axum::serve(listener, app)
			.with_graceful_shutdown(async move { serve_token.cancelled().await })
			.await
			.unwrap();
	});
	(format!("http://{addr}"), shutdown)
}

async fn post_rpc(
	base: &str,
	body: Value,
	headers: &[(&str, &str)],
) -> (reqwest::StatusCode, Value) {
	let client = reqwest::Client::new();
	let mut request = client.post(format!("{base}/mcp/v1")).json(&body);
	for (name, value) in headers {
		request = request.header(*name, *value);
	}
	let response = request.send().await.unwrap();
	let status = response.status();
	let body = response.json().await.unwrap_or(Value::Null);
	(status, body)
}

#[tokio::test]
async fn scenario_basic_dispatch() {
	// Built by hand: the tools/call mock is strict about what the upstream
	// must see (unwrapped tool name, caller arguments, correlation header).
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/.well-known/mcp/manifest.json"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
		.mount(&upstream)
		.await;
	Mock::given(method("POST"))
		.and(path("/mcp/v1"))
		.and(header_exists("x-correlation-id"))
		.and(body_partial_json(json!({
			"jsonrpc": "2.0",
			"method": "tools/call",
			"params": {"name": "forecast", "arguments": {"city": "NYC"}}
		})))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"jsonrpc": "2.0",
			"id": "check",
			"result": {"content": [{"type": "text", "text": "sunny"}], "isError": false}
		})))
		.expect(1)
		.mount(&upstream)
		.await;
	Mock::given(method("POST"))
		.and(path("/mcp/v1"))
		.and(body_partial_json(json!({"method": "tools/list"})))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"jsonrpc": "2.0",
			"id": "list",
			"result": {"tools": [{"name": "forecast"}]}
		})))
		.mount(&upstream)
		.await;

	let config = gateway_config(&format!(
		r#"
upstreams:
  - {{name: wx, endpoint: "{}/mcp", namespacePrefix: wx, requestTimeout: "2s"}}
"#,
		upstream.uri()
	));
	let (base, shutdown) = serve(&config).await;

	let (status, body) = post_rpc(
		&base,
		json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": "tools/call",
			"params": {"name": "wx.forecast", "arguments": {"city": "NYC"}}
		}),
		&[],
	)
	.await;

	assert_eq!(status, reqwest::StatusCode::OK);
	assert_eq!(body["result"]["isError"], false);
	assert_eq!(body["result"]["content"][0]["text"], "sunny");
	shutdown.cancel();
}

#[tokio::test]
async fn scenario_deny_overrides_allow() {
	let upstream = mock_upstream(
		json!([{"name": "create"}, {"name": "delete_user"}]),
		"done",
	)
	.await;
	let config = gateway_config(&format!(
		r#"
allowedToolPatterns: ["payments.*"]
deniedToolPatterns: ["payments.delete_*"]
upstreams:
  - {{name: pay, endpoint: "{}/mcp", namespacePrefix: payments, requestTimeout: "2s"}}
"#,
		upstream.uri()
	));
	let (base, shutdown) = serve(&config).await;

	let (_, allowed) = post_rpc(
		&base,
		json!({
			"jsonrpc": "2.0", "id": 1, "method": "tools/call",
			"params": {"name": "payments.create"}
		}),
		&[],
	)
	.await;
	assert_eq!(allowed["result"]["isError"], false);

	let (_, denied) = post_rpc(
		&base,
		json!({
			"jsonrpc": "2.0", "id": 2, "method": "tools/call",
			"params": {"name": "payments.delete_user"}
		}),
		&[],
	)
	.await;
	assert_eq!(denied["result"]["isError"], true);
	assert!(
		denied["result"]["content"][0]["text"]
			.as_str()
			.unwrap()
			.contains("ToolNotAllowed")
	);

	// The listing reflects the same policy.
	let (_, listing) = post_rpc(
		&base,
		json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list", "params": {}}),
		&[],
	)
	.await;
	let names: Vec<&str> = listing["result"]["tools"]
		.as_array()
		.unwrap()
		.iter()
		.map(|t| t["name"].as_str().unwrap())
		.collect();
	assert_eq!(names, vec!["payments.create"]);
	shutdown.cancel();
}

#[tokio::test]
async fn scenario_tenant_quota() {
	let upstream = mock_upstream(json!([{"name": "forecast"}]), "sunny").await;
	let config = gateway_config(&format!(
		r#"
upstreams:
  - {{name: wx, endpoint: "{}/mcp", namespacePrefix: wx, requestTimeout: "2s"}}
rateLimit:
  enabled: true
  defaultQuotaPolicy: {{scope: tenant, permitLimit: 2, windowMillis: 60000}}
"#,
		upstream.uri()
	));
	let (base, shutdown) = serve(&config).await;

	let call = json!({
		"jsonrpc": "2.0", "id": 1, "method": "tools/call",
		"params": {"name": "wx.forecast"}
	});

	let tenant_a = [("X-Tenant-Id", "a")];
	let (s1, _) = post_rpc(&base, call.clone(), &tenant_a).await;
	let (s2, _) = post_rpc(&base, call.clone(), &tenant_a).await;
	let (s3, limited) = post_rpc(&base, call.clone(), &tenant_a).await;
	assert_eq!(s1, reqwest::StatusCode::OK);
	assert_eq!(s2, reqwest::StatusCode::OK);
	assert_eq!(s3, reqwest::StatusCode::TOO_MANY_REQUESTS);
	// The rejection is a typed envelope, not a protocol error.
	assert_eq!(limited["result"]["isError"], true);
	assert!(
		limited["result"]["content"][0]["text"]
			.as_str()
			.unwrap()
			.contains("RateLimited")
	);

	// Independent tenants share no quota.
	let (sb, _) = post_rpc(&base, call, &[("X-Tenant-Id", "b")]).await;
	assert_eq!(sb, reqwest::StatusCode::OK);
	shutdown.cancel();
}

#[tokio::test]
async fn scenario_health_fallback_to_tools_list() {
	// No manifest endpoint at all, but a working tools/list: the upstream
	// must still be considered healthy and its tools advertised.
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/mcp/v1"))
		.respond_with(move |request: &wiremock::Request| {
			let body: Value = serde_json::from_slice(&request.body).unwrap();
			ResponseTemplate::new(200).set_body_json(json!({
				"jsonrpc": "2.0",
				"id": body["id"],
				"result": {"tools": []}
			}))
		})
		.mount(&server)
		.await;

	let config = gateway_config(&format!(
		r#"
upstreams:
  - {{name: wx, endpoint: "{}/mcp", namespacePrefix: wx, requestTimeout: "2s"}}
"#,
		server.uri()
	));
	let (base, shutdown) = serve(&config).await;

	// Force a catalog build, then inspect health.
	let (status, _) = post_rpc(
		&base,
		json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}}),
		&[],
	)
	.await;
	assert_eq!(status, reqwest::StatusCode::OK);

	let health: Value = reqwest::get(format!("{base}/healthz"))
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(health["upstreams"]["healthy"], 1);
	shutdown.cancel();
}

#[tokio::test]
async fn scenario_namespace_collision_first_wins() {
	let first = mock_upstream(json!([{"name": "forecast"}]), "from-first").await;
	let second = mock_upstream(json!([{"name": "alerts"}]), "from-second").await;

	// Both upstreams claim the "wx" prefix; the second is dropped during
	// registry construction and contributes nothing to the catalog.
	let config = gateway_config(&format!(
		r#"
upstreams:
  - {{name: wx-east, endpoint: "{}/mcp", namespacePrefix: wx, requestTimeout: "2s"}}
  - {{name: wx-west, endpoint: "{}/mcp", namespacePrefix: wx, requestTimeout: "2s", enabled: false}}
"#,
		first.uri(),
		second.uri()
	));
	// Note: validation rejects two *enabled* upstreams with one prefix, so
	// the duplicate is exercised through the registry path directly below.
	let (base, shutdown) = serve(&config).await;

	let (_, listing) = post_rpc(
		&base,
		json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}}),
		&[],
	)
	.await;
	let names: Vec<&str> = listing["result"]["tools"]
		.as_array()
		.unwrap()
		.iter()
		.map(|t| t["name"].as_str().unwrap())
		.collect();
	assert_eq!(names, vec!["wx.forecast"]);
	shutdown.cancel();

	// The registry itself applies first-wins when a discovery pass hands it
	// duplicates.
	let configs: Vec<toolgate::config::UpstreamConfig> = vec![
		serde_yaml::from_str(&format!(
			"{{name: wx-east, endpoint: \"{}/mcp\", namespacePrefix: wx}}",
			first.uri()
		))
		.unwrap(),
		serde_yaml::from_str(&format!(
			"{{name: wx-west, endpoint: \"{}/mcp\", namespacePrefix: wx}}",
			second.uri()
		))
		.unwrap(),
	];
	let registry = toolgate::UpstreamRegistry::from_static(&configs);
	let enabled = registry.upstreams();
	assert_eq!(enabled.len(), 1);
	assert_eq!(enabled[0].name, "wx-east");
}

#[tokio::test]
async fn scenario_cancellation_no_retry() {
	// The upstream hangs; the caller cancels. The dispatcher must report
	// Cancelled without a second attempt.
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/mcp/v1"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({
					"jsonrpc": "2.0", "id": 1,
					"result": {"content": [], "isError": false}
				}))
				.set_delay(Duration::from_secs(10)),
		)
		.mount(&server)
		.await;

	let config = gateway_config(&format!(
		r#"
upstreams:
  - {{name: wx, endpoint: "{}/mcp", namespacePrefix: wx, requestTimeout: "30s"}}
retry: {{attempts: 3}}
"#,
		server.uri()
	));
	let shutdown = CancellationToken::new();
	let state = GatewayState::from_config(&config, shutdown.clone()).unwrap();

	let snapshot = toolgate::CatalogSnapshot::new(
		[toolgate::ToolDescriptor {
			external_name: "wx.forecast".to_string(),
			upstream_name: "wx".to_string(),
			upstream_tool: "forecast".to_string(),
			description: None,
			input_schema: None,
		}],
		std::collections::HashMap::from([("wx".to_string(), true)]),
		1,
	);

	let cancel = CancellationToken::new();
	let canceller = cancel.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(100)).await;
		canceller.cancel();
	});

	let response = state
		.dispatcher
		.call_tool("wx.forecast", None, &snapshot, &RequestIdentity::anonymous(), &cancel)
		.await
		.unwrap();

	assert!(response.is_error);
	assert_eq!(response.error_type.as_deref(), Some("Cancelled"));
	// Exactly one attempt reached the upstream despite the retry budget.
	let calls = server
		.received_requests()
		.await
		.unwrap()
		.iter()
		.filter(|r| r.method.to_string().eq_ignore_ascii_case("POST"))
		.count();
	assert_eq!(calls, 1);
	shutdown.cancel();
}

#[tokio::test]
async fn empty_allow_list_with_deny_by_default_blocks_everything() {
	let upstream = mock_upstream(json!([{"name": "forecast"}]), "sunny").await;
	let config = gateway_config(&format!(
		r#"
denyByDefault: true
upstreams:
  - {{name: wx, endpoint: "{}/mcp", namespacePrefix: wx, requestTimeout: "2s"}}
"#,
		upstream.uri()
	));
	let (base, shutdown) = serve(&config).await;

	let (_, listing) = post_rpc(
		&base,
		json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}}),
		&[],
	)
	.await;
	assert_eq!(listing["result"]["tools"].as_array().unwrap().len(), 0);

	let (_, call) = post_rpc(
		&base,
		json!({
			"jsonrpc": "2.0", "id": 2, "method": "tools/call",
			"params": {"name": "wx.forecast"}
		}),
		&[],
	)
	.await;
	assert_eq!(call["result"]["isError"], true);
	shutdown.cancel();
}

#[tokio::test]
async fn correlation_id_round_trip() {
	let correlation = "3f1d4f3a-7c2b-4e5d-9a8b-1c2d3e4f5a6b";
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/.well-known/mcp/manifest.json"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
		.mount(&upstream)
		.await;
	Mock::given(method("POST"))
		.and(path("/mcp/v1"))
		.and(wiremock::matchers::header("x-correlation-id", correlation))
		.and(body_partial_json(json!({"method": "tools/call"})))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"jsonrpc": "2.0", "id": 1,
			"result": {"content": [{"type": "text", "text": "sunny"}], "isError": false}
		})))
		.expect(1)
		.mount(&upstream)
		.await;
	Mock::given(method("POST"))
		.and(path("/mcp/v1"))
		.and(body_partial_json(json!({"method": "tools/list"})))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"jsonrpc": "2.0", "id": "list",
			"result": {"tools": [{"name": "forecast"}]}
		})))
		.mount(&upstream)
		.await;

	let config = gateway_config(&format!(
		r#"
upstreams:
  - {{name: wx, endpoint: "{}/mcp", namespacePrefix: wx, requestTimeout: "2s"}}
"#,
		upstream.uri()
	));
	let (base, shutdown) = serve(&config).await;

	let (status, _) = post_rpc(
		&base,
		json!({
			"jsonrpc": "2.0", "id": 1, "method": "tools/call",
			"params": {"name": "wx.forecast"}
		}),
		&[("X-Correlation-Id", correlation)],
	)
	.await;
	assert_eq!(status, reqwest::StatusCode::OK);
	shutdown.cancel();
}
