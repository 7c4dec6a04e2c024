use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Venue-reported transaction type hint. Also names the logical fetch stream
/// a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
	Normal,
	Internal,
	Token,
	BeaconWithdrawal,
	Ledger,
	CsvRow,
}

impl TransactionKind {
	/// Canonical stream order; importers iterate logical streams in this
	/// order so runs are deterministic.
	pub const ALL: [TransactionKind; 6] = [
		TransactionKind::Normal,
		TransactionKind::Internal,
		TransactionKind::Token,
		TransactionKind::BeaconWithdrawal,
		TransactionKind::Ledger,
		TransactionKind::CsvRow,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			TransactionKind::Normal => "normal",
			TransactionKind::Internal => "internal",
			TransactionKind::Token => "token",
			TransactionKind::BeaconWithdrawal => "beacon_withdrawal",
			TransactionKind::Ledger => "ledger",
			TransactionKind::CsvRow => "csv_row",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"normal" => Some(TransactionKind::Normal),
			"internal" => Some(TransactionKind::Internal),
			"token" => Some(TransactionKind::Token),
			"beacon_withdrawal" => Some(TransactionKind::BeaconWithdrawal),
			"ledger" => Some(TransactionKind::Ledger),
			"csv_row" => Some(TransactionKind::CsvRow),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
	Pending,
	Processed,
	Failed,
}

impl ProcessingStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			ProcessingStatus::Pending => "pending",
			ProcessingStatus::Processed => "processed",
			ProcessingStatus::Failed => "failed",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"pending" => Some(ProcessingStatus::Pending),
			"processed" => Some(ProcessingStatus::Processed),
			"failed" => Some(ProcessingStatus::Failed),
			_ => None,
		}
	}
}

/// Deterministic 256-bit id over a raw row's provenance. Fields are
/// length-prefixed so concatenation cannot alias across boundaries.
pub fn event_id(
	source_name: &str,
	provider_name: &str,
	venue_transaction_id: &str,
	transaction_type_hint: TransactionKind,
	source_address: Option<&str>,
) -> String {
	let mut hasher = Sha256::new();
	for part in [
		source_name,
		provider_name,
		venue_transaction_id,
		transaction_type_hint.as_str(),
		source_address.unwrap_or(""),
	] {
		hasher.update((part.len() as u64).to_be_bytes());
		hasher.update(part.as_bytes());
	}
	hex::encode(hasher.finalize())
}

/// A raw row as produced by the importer, before it gets a database id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRawTransaction {
	pub source_name: String,
	pub provider_name: String,
	pub venue_transaction_id: String,
	pub transaction_type_hint: TransactionKind,
	pub source_address: Option<String>,
	pub payload: serde_json::Value,
	pub normalized_preview: Option<serde_json::Value>,
}

impl NewRawTransaction {
	pub fn event_id(&self) -> String {
		event_id(
			&self.source_name,
			&self.provider_name,
			&self.venue_transaction_id,
			self.transaction_type_hint,
			self.source_address.as_deref(),
		)
	}

	/// In-run dedup key: identity without provider provenance.
	pub fn identity(&self) -> (String, TransactionKind, Option<String>) {
		(
			self.venue_transaction_id.clone(),
			self.transaction_type_hint,
			self.source_address.clone(),
		)
	}
}

/// A persisted raw row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
	pub id: i64,
	pub session_id: i64,
	pub source_name: String,
	pub provider_name: String,
	pub venue_transaction_id: String,
	pub transaction_type_hint: TransactionKind,
	pub source_address: Option<String>,
	pub payload: serde_json::Value,
	pub normalized_preview: Option<serde_json::Value>,
	pub event_id: String,
	pub processing_status: ProcessingStatus,
	pub error: Option<String>,
	pub created_at: DateTime<Utc>,
}
