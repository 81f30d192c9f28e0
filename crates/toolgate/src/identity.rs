// Request identity extraction.
//
// Tenant and user come from configurable headers; a missing header maps to
// the literal "anonymous" so that unauthenticated traffic still lands in a
// quota bucket. The correlation id is reused from the inbound header only
// when it parses as a UUID.

use http::HeaderMap;
use uuid::Uuid;

use crate::client::CORRELATION_HEADER;
use crate::config::TenantResolutionConfig;

pub const ANONYMOUS: &str = "anonymous";

/// Who is calling, for rate limiting and auditing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
	pub tenant: String,
	pub user: String,
	/// Always a valid UUID string: reused from the request when parseable,
	/// regenerated otherwise.
	pub correlation_id: String,
}

impl RequestIdentity {
	pub fn anonymous() -> Self {
		Self {
			tenant: ANONYMOUS.to_string(),
			user: ANONYMOUS.to_string(),
			correlation_id: Uuid::new_v4().to_string(),
		}
	}

	pub fn from_headers(headers: &HeaderMap, resolution: &TenantResolutionConfig) -> Self {
		let tenant = header_value(headers, &resolution.tenant_header_name)
			.unwrap_or_else(|| ANONYMOUS.to_string());
		let user = header_value(headers, &resolution.user_header_name)
			.unwrap_or_else(|| ANONYMOUS.to_string());

		let correlation_id = header_value(headers, CORRELATION_HEADER)
			.and_then(|raw| Uuid::parse_str(&raw).ok())
			.map(|uuid| uuid.to_string())
			.unwrap_or_else(|| Uuid::new_v4().to_string());

		Self {
			tenant,
			user,
			correlation_id,
		}
	}
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
	headers
		.get(name)
		.and_then(|v| v.to_str().ok())
		.filter(|v| !v.is_empty())
		.map(|v| v.to_string())
}
