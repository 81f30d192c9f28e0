// Tool name translation between external (client-facing) and upstream names.
//
// Every tool advertised by the gateway is named `<prefix><separator><tool>`,
// where the prefix identifies the upstream that owns the tool. The prefix is
// applied unconditionally, even when the upstream tool name itself contains
// the separator.

use thiserror::Error;

/// Characters permitted in a namespace prefix.
fn is_prefix_char(c: char) -> bool {
	c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

/// Errors raised by [`ToolNameService`]. These indicate caller bugs and are
/// raised synchronously rather than surfaced in a response envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamingError {
	#[error("separator must not be empty")]
	EmptySeparator,

	#[error("namespace prefix must not be empty")]
	EmptyPrefix,

	#[error("tool name must not be empty")]
	EmptyToolName,

	#[error("namespace prefix '{0}' contains a disallowed character")]
	InvalidPrefixCharacter(String),

	#[error("external name '{external}' does not start with '{expected}'")]
	PrefixMismatch { external: String, expected: String },

	#[error("external name '{0}' has an empty upstream tool name")]
	EmptyInternalName(String),
}

/// Validate a namespace prefix: non-empty, `[A-Za-z0-9._-]` only.
pub fn validate_prefix(prefix: &str) -> Result<(), NamingError> {
	if prefix.is_empty() {
		return Err(NamingError::EmptyPrefix);
	}
	if !prefix.chars().all(is_prefix_char) {
		return Err(NamingError::InvalidPrefixCharacter(prefix.to_string()));
	}
	Ok(())
}

/// Bidirectional `(prefix, upstream tool) <-> external tool` translation.
#[derive(Debug, Clone)]
pub struct ToolNameService {
	separator: String,
}

impl Default for ToolNameService {
	fn default() -> Self {
		Self::new(".").expect("default separator is non-empty")
	}
}

impl ToolNameService {
	pub fn new(separator: impl Into<String>) -> Result<Self, NamingError> {
		let separator = separator.into();
		if separator.is_empty() {
			return Err(NamingError::EmptySeparator);
		}
		Ok(Self { separator })
	}

	pub fn separator(&self) -> &str {
		&self.separator
	}

	/// Build the external name for an upstream tool.
	pub fn to_external(&self, prefix: &str, upstream_tool: &str) -> Result<String, NamingError> {
		validate_prefix(prefix)?;
		if upstream_tool.is_empty() {
			return Err(NamingError::EmptyToolName);
		}
		Ok(format!("{prefix}{}{upstream_tool}", self.separator))
	}

	/// Strip `prefix + separator` from the head of an external name.
	pub fn to_internal(&self, prefix: &str, external: &str) -> Result<String, NamingError> {
		validate_prefix(prefix)?;
		let expected = format!("{prefix}{}", self.separator);
		let Some(rest) = external.strip_prefix(&expected) else {
			return Err(NamingError::PrefixMismatch {
				external: external.to_string(),
				expected,
			});
		};
		if rest.is_empty() {
			return Err(NamingError::EmptyInternalName(external.to_string()));
		}
		Ok(rest.to_string())
	}

	/// Whether an external name belongs to the given namespace. Total; never
	/// raises, even for invalid prefixes.
	pub fn belongs_to_upstream(&self, prefix: &str, external: &str) -> bool {
		if validate_prefix(prefix).is_err() {
			return false;
		}
		match external.strip_prefix(prefix) {
			Some(rest) => {
				rest.starts_with(self.separator.as_str()) && rest.len() > self.separator.len()
			},
			None => false,
		}
	}

	/// Extract the namespace prefix preceding the *last* separator occurrence,
	/// if that substring is a valid prefix.
	pub fn extract_namespace_prefix(&self, external: &str) -> Option<String> {
		let idx = external.rfind(self.separator.as_str())?;
		let prefix = &external[..idx];
		validate_prefix(prefix).ok()?;
		Some(prefix.to_string())
	}
}
