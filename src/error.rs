//! Error taxonomy shared by every subsystem.
//!
//! Filter stages (route matching, inhibition, silencing) never produce an
//! `Error` — they only observe and continue. Everything that *can* fail
//! funnels through one of these variants so callers can match on the
//! taxonomy instead of downcasting a diagnostic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	/// Malformed input: a bad matcher, an inverted time window, an
	/// ill-formed alert. Carries a human-readable multi-error body when the
	/// caller submitted a batch.
	#[error("validation failed: {0}")]
	Validation(String),

	/// Operation referenced a silence/id that doesn't exist.
	#[error("not found: {0}")]
	NotFound(String),

	/// Attempted to update a silence that has already expired; the caller
	/// must re-create it instead.
	#[error("conflict: {0}")]
	Conflict(String),

	/// A receiver or provider operation failed in a way that's worth
	/// retrying (I/O hiccup, receiver said "try again").
	#[error("transient failure: {0}")]
	Transient(String),

	/// Retries exhausted, or the receiver said "don't bother retrying".
	#[error("permanent failure: {0}")]
	Permanent(String),

	/// Corrupt snapshot at boot, or an invariant that should be impossible
	/// to violate was violated anyway. Surfaced all the way to the process.
	#[error("fatal: {0}")]
	Fatal(String),
}

impl Error {
	pub fn validation(msg: impl Into<String>) -> Self {
		Self::Validation(msg.into())
	}

	pub fn not_found(msg: impl Into<String>) -> Self {
		Self::NotFound(msg.into())
	}

	pub fn conflict(msg: impl Into<String>) -> Self {
		Self::Conflict(msg.into())
	}

	pub fn transient(msg: impl Into<String>) -> Self {
		Self::Transient(msg.into())
	}

	pub fn permanent(msg: impl Into<String>) -> Self {
		Self::Permanent(msg.into())
	}

	pub fn fatal(msg: impl Into<String>) -> Self {
		Self::Fatal(msg.into())
	}

	/// Whether retry-notify should keep trying (see `pipeline::retry_notify`).
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::Transient(_))
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A batch-validation failure: zero or more per-item errors, collected so
/// that valid items in the same batch are still accepted (§6 "Alert
/// ingestion").
#[derive(Debug, Error)]
#[error("{} of {} item(s) failed validation", errors.len(), total)]
pub struct MultiError {
	pub total: usize,
	pub errors: Vec<(usize, String)>,
}

impl MultiError {
	pub fn is_empty(&self) -> bool {
		self.errors.is_empty()
	}
}
