use thiserror::Error;

use crate::{provider::ProviderError, store::StoreError};

/// Top-level error for a pipeline run. Everything carries a stable code so
/// session records stay machine-readable.
#[derive(Debug, Error)]
pub enum IngestError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Provider(#[from] ProviderError),

	#[error("invalid input for {field}: {message}")]
	InvalidInput { field: &'static str, message: String },

	#[error("credentials rejected by {source_name}: {message}")]
	Credentials { source_name: String, message: String },

	#[error("address gap scan aborted: {message}")]
	GapScan { message: String },
}

impl IngestError {
	pub fn code(&self) -> &'static str {
		match self {
			IngestError::Store(e) => e.code(),
			IngestError::Provider(e) => e.code(),
			IngestError::InvalidInput { .. } => "INVALID_INPUT",
			IngestError::Credentials { .. } => "CREDENTIALS_REJECTED",
			IngestError::GapScan { .. } => "GAP_SCAN_ABORTED",
		}
	}

	/// Errors that make the whole session fail rather than a single stream.
	pub fn is_fatal_for_session(&self) -> bool {
		matches!(
			self,
			IngestError::Credentials { .. }
				| IngestError::InvalidInput { .. }
				| IngestError::Store(_)
		)
	}

	pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
		IngestError::InvalidInput { field, message: message.into() }
	}
}
