// Structured audit trail for tool invocations.
//
// Every dispatch emits one start and one end event carrying the invocation
// and correlation ids. Raw arguments never reach the log stream; they are
// summarized as a UTF-8 byte count and a 32-bit hash. Recording is
// infallible by contract so that audit problems can never affect the
// request path.

use serde_json::{Map, Value};

const PRIME32_2: u32 = 2_246_822_519;
const PRIME32_3: u32 = 3_266_489_917;
const PRIME32_4: u32 = 668_265_263;
const PRIME32_5: u32 = 374_761_393;

/// Simplified xxHash32: the 4-lane initial accumulator is replaced by
/// `seed + PRIME32_5 + len`, and a 1-3 byte tail is packed into a single
/// little-endian word instead of being mixed byte by byte. Digests are NOT
/// interoperable with canonical xxHash32.
pub fn xxhash32(data: &[u8], seed: u32) -> u32 {
	let mut acc = seed
		.wrapping_add(PRIME32_5)
		.wrapping_add(data.len() as u32);

	let mut chunks = data.chunks_exact(4);
	for chunk in &mut chunks {
		let lane = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
		acc = acc
			.wrapping_add(lane.wrapping_mul(PRIME32_3))
			.rotate_left(17)
			.wrapping_mul(PRIME32_4);
	}

	let tail = chunks.remainder();
	if !tail.is_empty() {
		let mut word = [0u8; 4];
		word[..tail.len()].copy_from_slice(tail);
		let lane = u32::from_le_bytes(word);
		acc = acc
			.wrapping_add(lane.wrapping_mul(PRIME32_3))
			.rotate_left(17)
			.wrapping_mul(PRIME32_4);
	}

	acc ^= acc >> 15;
	acc = acc.wrapping_mul(PRIME32_2);
	acc ^= acc >> 13;
	acc = acc.wrapping_mul(PRIME32_3);
	acc ^= acc >> 16;
	acc
}

/// UTF-8 byte count and lowercase-hex hash of a tool's arguments.
pub fn describe_arguments(arguments: &Map<String, Value>) -> (usize, String) {
	let serialized = Value::Object(arguments.clone()).to_string();
	let bytes = serialized.as_bytes();
	(bytes.len(), format!("{:08x}", xxhash32(bytes, 0)))
}

#[derive(Debug, Clone)]
pub struct AuditStart {
	pub invocation_id: String,
	pub external_tool: String,
	pub upstream: String,
	pub correlation_id: String,
	pub args_size: Option<usize>,
	pub args_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuditEnd {
	pub invocation_id: String,
	pub external_tool: String,
	pub upstream: String,
	pub correlation_id: String,
	pub success: bool,
	pub duration_ms: u64,
	pub error_type: Option<String>,
	pub error_message: Option<String>,
}

/// Sink for audit events. An optional collaborator: the dispatcher checks
/// for presence rather than calling through a no-op. Implementations must
/// not fail; anything that can go wrong has to be swallowed internally.
pub trait AuditRecorder: Send + Sync {
	fn record_start(&self, event: &AuditStart);
	fn record_end(&self, event: &AuditEnd);
}

/// Recorder that emits structured tracing events at `target: "audit"`.
#[derive(Debug, Default)]
pub struct TracingAuditRecorder;

impl AuditRecorder for TracingAuditRecorder {
	fn record_start(&self, event: &AuditStart) {
		tracing::info!(
			target: "audit",
			kind = "tool_call_start",
			invocation_id = %event.invocation_id,
			tool = %event.external_tool,
			upstream = %event.upstream,
			correlation_id = %event.correlation_id,
			args_size = event.args_size,
			args_hash = event.args_hash.as_deref(),
			"tool call started"
		);
	}

	fn record_end(&self, event: &AuditEnd) {
		tracing::info!(
			target: "audit",
			kind = "tool_call_end",
			invocation_id = %event.invocation_id,
			tool = %event.external_tool,
			upstream = %event.upstream,
			correlation_id = %event.correlation_id,
			success = event.success,
			duration_ms = event.duration_ms,
			error_type = event.error_type.as_deref(),
			error_message = event.error_message.as_deref(),
			"tool call finished"
		);
	}
}
