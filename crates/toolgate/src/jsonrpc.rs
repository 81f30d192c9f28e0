// JSON-RPC 2.0 envelope and MCP payload types.
//
// The gateway re-wraps envelopes between clients and arbitrary JSON-RPC
// upstreams, so it owns these wire types instead of adopting an SDK's model.
// Unknown fields are preserved nowhere; payloads the gateway does not
// interpret travel as raw `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes used by the gateway.
pub mod code {
	pub const INVALID_REQUEST: i64 = -32600;
	pub const METHOD_NOT_FOUND: i64 = -32601;
	pub const INVALID_PARAMS: i64 = -32602;
	pub const INTERNAL_ERROR: i64 = -32603;
}

/// Recognized MCP methods.
pub mod method {
	pub const INITIALIZE: &str = "initialize";
	pub const TOOLS_LIST: &str = "tools/list";
	pub const TOOLS_CALL: &str = "tools/call";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
	pub jsonrpc: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<Value>,
	pub method: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
}

impl JsonRpcRequest {
	pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
		Self {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id: Some(id.into()),
			method: method.into(),
			params: Some(params),
		}
	}

	/// Build an outbound `tools/call` request for an upstream.
	pub fn call_tool(id: impl Into<Value>, tool: &str, arguments: Map<String, Value>) -> Self {
		Self::new(
			id,
			method::TOOLS_CALL,
			serde_json::json!({ "name": tool, "arguments": arguments }),
		)
	}

	/// Build an outbound `tools/list` request.
	pub fn list_tools(id: impl Into<Value>) -> Self {
		Self::new(id, method::TOOLS_LIST, serde_json::json!({}))
	}

	pub fn is_supported_version(&self) -> bool {
		self.jsonrpc == JSONRPC_VERSION
	}

	/// The id to echo back, `null` when the request carried none.
	pub fn id_or_null(&self) -> Value {
		self.id.clone().unwrap_or(Value::Null)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
	pub code: i64,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
	pub jsonrpc: String,
	pub id: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
	pub fn result(id: Value, result: Value) -> Self {
		Self {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id,
			result: Some(result),
			error: None,
		}
	}

	pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
		Self {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id,
			result: None,
			error: Some(JsonRpcError {
				code,
				message: message.into(),
				data: None,
			}),
		}
	}
}

/// A tool as advertised to clients in `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
	pub tools: Vec<ToolEntry>,
}

/// Parameters of an inbound `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub arguments: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
	pub content: Vec<Value>,
	#[serde(rename = "isError", default)]
	pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
	pub name: String,
	pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
	/// Presence of the key advertises tool support; the object is empty.
	pub tools: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
	pub protocol_version: String,
	pub server_info: ServerInfo,
	pub capabilities: ServerCapabilities,
}
