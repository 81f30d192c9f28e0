// Bounded-retry execution around outbound transport operations.
//
// The policy classifies transport failures as transient (5xx, 429,
// connection errors, timeouts) or fatal (other 4xx), bounds the number of
// attempts, and sleeps a caller-supplied backoff schedule between attempts.
// Caller cancellation always wins: it is never retried and never reported as
// a transport failure.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Per-invocation context threaded through every attempt. A retry derives a
/// new context with `attempt_number + 1`; all other fields are invariant for
/// the life of the invocation.
#[derive(Debug, Clone)]
pub struct ResiliencyContext {
	pub external_tool: String,
	pub upstream: String,
	pub endpoint: String,
	pub correlation_id: String,
	pub invocation_id: String,
	pub attempt_number: u32,
}

impl ResiliencyContext {
	pub fn new(
		external_tool: impl Into<String>,
		upstream: impl Into<String>,
		endpoint: impl Into<String>,
		correlation_id: impl Into<String>,
		invocation_id: impl Into<String>,
	) -> Self {
		Self {
			external_tool: external_tool.into(),
			upstream: upstream.into(),
			endpoint: endpoint.into(),
			correlation_id: correlation_id.into(),
			invocation_id: invocation_id.into(),
			attempt_number: 0,
		}
	}

	/// Derive the context for the next attempt.
	pub fn retry_context(&self) -> Self {
		Self {
			attempt_number: self.attempt_number + 1,
			..self.clone()
		}
	}
}

/// Transport-level failure of a single attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
	#[error("upstream returned HTTP {0}")]
	Status(u16),

	#[error("connection failed: {0}")]
	Connect(String),

	#[error("request timed out after {0:?}")]
	Timeout(Duration),

	#[error("malformed response: {0}")]
	Malformed(String),
}

impl TransportError {
	/// Transient failures are worth another attempt: server-side errors,
	/// throttling, connection failures, and timeouts. Other client errors
	/// are fatal.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Status(status) => *status >= 500 || *status == 429,
			Self::Connect(_) | Self::Timeout(_) => true,
			// A syntactically broken reply will not get better on retry.
			Self::Malformed(_) => false,
		}
	}
}

#[derive(Debug, Error)]
pub enum ResiliencyError {
	/// All permitted attempts failed with transient errors.
	#[error("all {attempts} attempts failed: {source}")]
	Exhausted { attempts: u32, source: TransportError },

	/// A fatal failure; retrying would not help.
	#[error("non-retryable failure: {0}")]
	Fatal(TransportError),

	/// The caller's token was cancelled. Never retried, never converted into
	/// a timeout or a resiliency failure.
	#[error("operation cancelled")]
	Cancelled,
}

/// Retry policy for outbound operations.
#[derive(Debug, Clone)]
pub struct ResiliencyPolicy {
	max_attempts: u32,
	backoff: Vec<Duration>,
}

impl ResiliencyPolicy {
	/// Single attempt; a transient failure is reported as exhausted
	/// immediately.
	pub fn no_retry() -> Self {
		Self {
			max_attempts: 1,
			backoff: Vec::new(),
		}
	}

	/// Up to `max_attempts` total attempts. `backoff[n]` is slept after the
	/// `n`-th failed attempt; the last entry repeats for later attempts.
	pub fn retrying(max_attempts: u32, backoff: Vec<Duration>) -> Self {
		Self {
			max_attempts: max_attempts.max(1),
			backoff,
		}
	}

	pub fn max_attempts(&self) -> u32 {
		self.max_attempts
	}

	fn backoff_after(&self, failed_attempts: u32) -> Duration {
		if self.backoff.is_empty() {
			return Duration::ZERO;
		}
		let idx = (failed_attempts as usize)
			.saturating_sub(1)
			.min(self.backoff.len() - 1);
		self.backoff[idx]
	}

	/// Run `op` under this policy. The operation receives the context for
	/// its attempt (attempt numbers continue from `ctx.attempt_number`).
	pub async fn execute<T, F, Fut>(
		&self,
		ctx: &ResiliencyContext,
		cancel: &CancellationToken,
		mut op: F,
	) -> Result<T, ResiliencyError>
	where
		F: FnMut(ResiliencyContext) -> Fut,
		Fut: Future<Output = Result<T, TransportError>>,
	{
		let mut ctx = ctx.clone();
		let mut attempts = 0u32;
		loop {
			if cancel.is_cancelled() {
				return Err(ResiliencyError::Cancelled);
			}

			attempts += 1;
			let outcome = tokio::select! {
				biased;
				_ = cancel.cancelled() => return Err(ResiliencyError::Cancelled),
				outcome = op(ctx.clone()) => outcome,
			};

			let err = match outcome {
				Ok(value) => return Ok(value),
				Err(err) if !err.is_transient() => return Err(ResiliencyError::Fatal(err)),
				Err(err) => err,
			};

			if attempts >= self.max_attempts {
				return Err(ResiliencyError::Exhausted {
					attempts,
					source: err,
				});
			}

			tracing::debug!(
				target: "resiliency",
				tool = %ctx.external_tool,
				upstream = %ctx.upstream,
				attempt = ctx.attempt_number,
				error = %err,
				"transient failure, retrying"
			);

			let delay = self.backoff_after(attempts);
			if !delay.is_zero() {
				tokio::select! {
					biased;
					_ = cancel.cancelled() => return Err(ResiliencyError::Cancelled),
					_ = tokio::time::sleep(delay) => {},
				}
			}
			ctx = ctx.retry_context();
		}
	}
}
