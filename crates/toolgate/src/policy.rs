// Allow/deny policy over external tool names.
//
// Pattern sets are compiled once at construction and read-only afterwards.
// Deny always wins; an allow list, when present, is exhaustive.

use crate::patterns::{CompiledPattern, PatternError};

#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
	allowed: Vec<CompiledPattern>,
	denied: Vec<CompiledPattern>,
	deny_by_default: bool,
}

impl ToolPolicy {
	pub fn new<'a, A, D>(allowed: A, denied: D, deny_by_default: bool) -> Result<Self, PatternError>
	where
		A: IntoIterator<Item = &'a str>,
		D: IntoIterator<Item = &'a str>,
	{
		Ok(Self {
			allowed: CompiledPattern::compile_all(allowed)?,
			denied: CompiledPattern::compile_all(denied)?,
			deny_by_default,
		})
	}

	/// Decide whether a tool may be advertised or invoked. Evaluation
	/// order: denied patterns, then the allowed set, then the default.
	pub fn is_allowed(&self, external_name: &str) -> bool {
		if self.denied.iter().any(|p| p.matches(external_name)) {
			return false;
		}
		if !self.allowed.is_empty() {
			return self.allowed.iter().any(|p| p.matches(external_name));
		}
		!self.deny_by_default
	}

	/// Whether any policy is in force at all.
	pub fn is_active(&self) -> bool {
		self.deny_by_default || !self.allowed.is_empty() || !self.denied.is_empty()
	}

	/// Apply `is_allowed` pointwise, preserving order and dropping empty
	/// names.
	pub fn filter_allowed<I, S>(&self, names: I) -> Vec<String>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		names
			.into_iter()
			.map(Into::into)
			.filter(|name| !name.is_empty() && self.is_allowed(name))
			.collect()
	}
}
