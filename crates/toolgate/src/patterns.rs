// Wildcard pattern compilation and matching for tool-name policies.
//
// Patterns are compiled once (at policy or rate-limit construction) and
// matched with plain byte comparisons afterwards. The language is
// deliberately small: a single `*` marks a prefix, suffix, or contains-style
// pattern. Patterns with more than one `*` are accepted, but only the
// outermost prefix and suffix are enforced.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
	#[error("pattern must not be empty")]
	Empty,

	#[error("pattern '{0}': '?' wildcards are not supported")]
	QuestionMark(String),

	#[error("pattern '{0}': consecutive '**' is not supported")]
	DoubleStar(String),
}

/// A compiled tool-name pattern. Matching is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledPattern {
	/// No wildcard; the whole name must match.
	Exact(String),
	/// `foo*`
	Prefix(String),
	/// `*foo`
	Suffix(String),
	/// `foo*bar`; also the reduction of multi-wildcard patterns, where only
	/// the leading prefix and trailing suffix are honoured.
	Wildcard { prefix: String, suffix: String },
}

impl CompiledPattern {
	/// Compile a textual pattern. Rejects empty patterns, `?`, and `**`.
	pub fn compile(pattern: &str) -> Result<Self, PatternError> {
		if pattern.is_empty() {
			return Err(PatternError::Empty);
		}
		if pattern.contains('?') {
			return Err(PatternError::QuestionMark(pattern.to_string()));
		}
		if pattern.contains("**") {
			return Err(PatternError::DoubleStar(pattern.to_string()));
		}

		let Some(first) = pattern.find('*') else {
			return Ok(Self::Exact(pattern.to_string()));
		};
		// The last '*' may equal the first; middle wildcards are ignored.
		let last = pattern.rfind('*').expect("find succeeded");

		let prefix = &pattern[..first];
		let suffix = &pattern[last + 1..];
		match (prefix.is_empty(), suffix.is_empty()) {
			(true, true) => Ok(Self::Wildcard {
				prefix: String::new(),
				suffix: String::new(),
			}),
			(false, true) => Ok(Self::Prefix(prefix.to_string())),
			(true, false) => Ok(Self::Suffix(suffix.to_string())),
			(false, false) => Ok(Self::Wildcard {
				prefix: prefix.to_string(),
				suffix: suffix.to_string(),
			}),
		}
	}

	/// Compile a list of patterns, failing on the first invalid entry.
	pub fn compile_all<'a, I>(patterns: I) -> Result<Vec<Self>, PatternError>
	where
		I: IntoIterator<Item = &'a str>,
	{
		patterns.into_iter().map(Self::compile).collect()
	}

	pub fn matches(&self, name: &str) -> bool {
		match self {
			Self::Exact(p) => name == p,
			Self::Prefix(p) => name.starts_with(p.as_str()),
			Self::Suffix(s) => name.ends_with(s.as_str()),
			Self::Wildcard { prefix, suffix } => {
				name.len() >= prefix.len() + suffix.len()
					&& name.starts_with(prefix.as_str())
					&& name.ends_with(suffix.as_str())
			},
		}
	}
}
