//! Provider abstraction: one adapter per venue API or file format, managed
//! by a failover-aware manager.

pub mod cache;
pub mod manager;

use std::{collections::HashSet, path::PathBuf, pin::Pin};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Cursor, TransactionKind};

pub use manager::{ProviderManager, ProviderManagerConfig, ProviderRegistration};

/// Capability tag for one operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
	GetRawAddressTransactions,
	GetAddressTransactions,
	GetAddressBalance,
	HasAddressTransactions,
	GetLedgerEntries,
	ReadCsvRows,
}

/// One operation routed through the provider manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOperation {
	/// All venue transactions for an address, untyped.
	GetRawAddressTransactions { address: String, cursor: Option<Cursor> },
	/// Transactions of one kind (normal, internal, token, beacon withdrawal).
	GetAddressTransactions {
		address: String,
		transaction_type: TransactionKind,
		cursor: Option<Cursor>,
	},
	GetAddressBalance { address: String },
	HasAddressTransactions { address: String },
	/// Exchange ledger entries, optionally narrowed to one asset.
	GetLedgerEntries { asset: Option<String>, cursor: Option<Cursor> },
	/// Rows of a local CSV export.
	ReadCsvRows { path: PathBuf, cursor: Option<Cursor> },
}

impl ProviderOperation {
	pub fn kind(&self) -> OperationKind {
		match self {
			ProviderOperation::GetRawAddressTransactions { .. } => {
				OperationKind::GetRawAddressTransactions
			},
			ProviderOperation::GetAddressTransactions { .. } => {
				OperationKind::GetAddressTransactions
			},
			ProviderOperation::GetAddressBalance { .. } => OperationKind::GetAddressBalance,
			ProviderOperation::HasAddressTransactions { .. } => {
				OperationKind::HasAddressTransactions
			},
			ProviderOperation::GetLedgerEntries { .. } => OperationKind::GetLedgerEntries,
			ProviderOperation::ReadCsvRows { .. } => OperationKind::ReadCsvRows,
		}
	}

	pub fn name(&self) -> &'static str {
		match self.kind() {
			OperationKind::GetRawAddressTransactions => "get_raw_address_transactions",
			OperationKind::GetAddressTransactions => "get_address_transactions",
			OperationKind::GetAddressBalance => "get_address_balance",
			OperationKind::HasAddressTransactions => "has_address_transactions",
			OperationKind::GetLedgerEntries => "get_ledger_entries",
			OperationKind::ReadCsvRows => "read_csv_rows",
		}
	}

	/// The transaction-kind discriminator, where the operation carries one.
	pub fn transaction_kind(&self) -> Option<TransactionKind> {
		match self {
			ProviderOperation::GetAddressTransactions { transaction_type, .. } => {
				Some(*transaction_type)
			},
			_ => None,
		}
	}

	pub fn cursor(&self) -> Option<&Cursor> {
		match self {
			ProviderOperation::GetRawAddressTransactions { cursor, .. }
			| ProviderOperation::GetAddressTransactions { cursor, .. }
			| ProviderOperation::GetLedgerEntries { cursor, .. }
			| ProviderOperation::ReadCsvRows { cursor, .. } => cursor.as_ref(),
			_ => None,
		}
	}

	/// Same operation repositioned at `cursor`; used when failing over to
	/// another provider between chunks.
	pub fn with_cursor(&self, cursor: Option<Cursor>) -> Self {
		let mut op = self.clone();
		match &mut op {
			ProviderOperation::GetRawAddressTransactions { cursor: c, .. }
			| ProviderOperation::GetAddressTransactions { cursor: c, .. }
			| ProviderOperation::GetLedgerEntries { cursor: c, .. }
			| ProviderOperation::ReadCsvRows { cursor: c, .. } => *c = cursor,
			_ => {},
		}
		op
	}

	/// Cache key for the manager's response cache. Includes the cursor
	/// position so resumed fetches never alias fresh ones.
	pub fn cache_key(&self, source: &str) -> Option<String> {
		let cursor_part = |cursor: &Option<Cursor>| {
			cursor
				.as_ref()
				.map(|c| serde_json::to_string(&c.primary).unwrap_or_default())
				.unwrap_or_else(|| "start".to_string())
		};
		match self {
			ProviderOperation::GetRawAddressTransactions { address, cursor } => Some(format!(
				"{source}:raw_txs:{address}:{}",
				cursor_part(cursor)
			)),
			ProviderOperation::GetAddressTransactions { address, transaction_type, cursor } => {
				Some(format!(
					"{source}:txs:{}:{address}:{}",
					transaction_type.as_str(),
					cursor_part(cursor)
				))
			},
			ProviderOperation::GetAddressBalance { address } => {
				Some(format!("{source}:balance:{address}"))
			},
			ProviderOperation::HasAddressTransactions { address } => {
				Some(format!("{source}:has_txs:{address}"))
			},
			ProviderOperation::GetLedgerEntries { asset, cursor } => Some(format!(
				"{source}:ledger:{}:{}",
				asset.as_deref().unwrap_or("*"),
				cursor_part(cursor)
			)),
			// Local files change underneath us; never cache.
			ProviderOperation::ReadCsvRows { .. } => None,
		}
	}
}

/// What one adapter can do. The manager filters candidates on this.
#[derive(Debug, Clone, Default)]
pub struct ProviderCapabilities {
	pub supported_operations: HashSet<OperationKind>,
	pub supported_transaction_kinds: HashSet<TransactionKind>,
}

impl ProviderCapabilities {
	pub fn new(
		operations: impl IntoIterator<Item = OperationKind>,
		kinds: impl IntoIterator<Item = TransactionKind>,
	) -> Self {
		Self {
			supported_operations: operations.into_iter().collect(),
			supported_transaction_kinds: kinds.into_iter().collect(),
		}
	}

	pub fn supports(&self, op: &ProviderOperation) -> bool {
		if !self.supported_operations.contains(&op.kind()) {
			return false;
		}
		match op.transaction_kind() {
			Some(kind) => self.supported_transaction_kinds.contains(&kind),
			None => true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSpec {
	pub requests_per_sec: f64,
	pub burst: u32,
}

impl Default for RateLimitSpec {
	fn default() -> Self {
		Self {
			requests_per_sec: crate::constants::DEFAULT_RATE_LIMIT_PER_SEC,
			burst: crate::constants::DEFAULT_RATE_LIMIT_BURST,
		}
	}
}

/// A successful single-shot response plus provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
	pub data: serde_json::Value,
	pub provider_name: String,
}

/// One venue row inside a streamed chunk, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
	pub venue_transaction_id: String,
	pub kind: TransactionKind,
	pub source_address: Option<String>,
	pub payload: serde_json::Value,
	pub normalized_preview: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChunkStats {
	pub fetched: u32,
	pub latency_ms: u64,
}

/// One slice of a streaming operation. The cursor is the resume position
/// after this chunk; `is_complete` marks the final slice.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
	pub rows: Vec<RawRow>,
	pub provider_name: String,
	pub cursor: Cursor,
	pub is_complete: bool,
	pub stats: ChunkStats,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<RawChunk, ProviderError>> + Send>>;

#[derive(Debug, Error)]
pub enum ProviderError {
	#[error("no providers registered for {source_name} supporting {operation}")]
	NoProviders { source_name: String, operation: &'static str },

	#[error("all providers failed for {operation} on {source_name} (tried {attempted:?}): {last_error}")]
	AllProvidersFailed {
		source_name: String,
		operation: &'static str,
		attempted: Vec<String>,
		last_error: String,
	},

	#[error("{provider} rejected credentials: {message}")]
	CredentialsRejected { provider: String, message: String },

	#[error("{provider} rate limited")]
	RateLimited { provider: String, retry_after_ms: Option<u64> },

	#[error("{provider} transport failure during {operation}: {message}")]
	Transport { provider: String, operation: &'static str, message: String },

	#[error("{provider} returned a malformed response: {message}")]
	Malformed { provider: String, message: String },

	#[error("{provider} timed out after {after_ms}ms")]
	Timeout { provider: String, after_ms: u64 },

	#[error("{provider} does not support {operation}")]
	Unsupported { provider: String, operation: &'static str },
}

impl ProviderError {
	pub fn code(&self) -> &'static str {
		match self {
			ProviderError::NoProviders { .. } => "NO_PROVIDERS",
			ProviderError::AllProvidersFailed { .. } => "ALL_PROVIDERS_FAILED",
			ProviderError::CredentialsRejected { .. } => "CREDENTIALS_REJECTED",
			ProviderError::RateLimited { .. } => "RATE_LIMITED",
			ProviderError::Transport { .. } => "TRANSPORT_FAILURE",
			ProviderError::Malformed { .. } => "MALFORMED_RESPONSE",
			ProviderError::Timeout { .. } => "TIMEOUT",
			ProviderError::Unsupported { .. } => "UNSUPPORTED_OPERATION",
		}
	}

	/// Credential rejections abort failover: another provider cannot fix the
	/// account's keys.
	pub fn is_credentials(&self) -> bool {
		matches!(self, ProviderError::CredentialsRejected { .. })
	}
}

/// One venue driver. Implementations hold their own HTTP client or file
/// handle and treat credentials as opaque blobs handed in at construction.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
	fn name(&self) -> &str;

	fn source(&self) -> &str;

	fn capabilities(&self) -> &ProviderCapabilities;

	/// Default pacing; the manager may override it from settings.
	fn rate_limit(&self) -> RateLimitSpec {
		RateLimitSpec::default()
	}

	/// Single-shot operation returning the venue-specific payload.
	async fn execute(&self, op: &ProviderOperation) -> Result<serde_json::Value, ProviderError>;

	/// Chunked fetch. Implementations resume from `op`'s cursor and must set
	/// `is_complete` on the final chunk.
	fn execute_streaming(&self, op: &ProviderOperation) -> ChunkStream;

	/// Cheap liveness probe.
	async fn is_healthy(&self) -> Result<bool, ProviderError>;

	/// Optional empirical rate discovery; adapters without one return None.
	async fn benchmark_rate_limit(&self) -> Result<Option<RateLimitSpec>, ProviderError> {
		Ok(None)
	}

	/// Candidate cursor values derivable from one venue row.
	fn extract_cursors(&self, row: &RawRow) -> Vec<Cursor>;

	/// Offset a cursor backwards by the configured overlap so resumed
	/// fetches catch late writes and reorgs.
	fn apply_replay_window(&self, cursor: &Cursor) -> Cursor;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cache_key_distinguishes_cursor_positions() {
		let op = |n| ProviderOperation::GetAddressTransactions {
			address: "0xme".to_string(),
			transaction_type: TransactionKind::Normal,
			cursor: Some(Cursor::new(crate::types::CursorPosition::BlockNumber(n), None)),
		};
		assert_ne!(op(1).cache_key("ethereum"), op(2).cache_key("ethereum"));
	}

	#[test]
	fn csv_reads_are_never_cached() {
		let op = ProviderOperation::ReadCsvRows { path: "a.csv".into(), cursor: None };
		assert_eq!(op.cache_key("binance-csv"), None);
	}

	#[test]
	fn capabilities_gate_transaction_kinds() {
		let caps = ProviderCapabilities::new(
			[OperationKind::GetAddressTransactions],
			[TransactionKind::Normal, TransactionKind::Token],
		);
		let normal = ProviderOperation::GetAddressTransactions {
			address: "0xme".to_string(),
			transaction_type: TransactionKind::Normal,
			cursor: None,
		};
		let internal = ProviderOperation::GetAddressTransactions {
			address: "0xme".to_string(),
			transaction_type: TransactionKind::Internal,
			cursor: None,
		};
		assert!(caps.supports(&normal));
		assert!(!caps.supports(&internal));
	}
}
