use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::FETCH_FAILED_SENTINEL;

/// Primary resumption position of a cursor. Compared only within the same
/// variant; a provider switch may legitimately change the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CursorPosition {
	BlockNumber(u64),
	Timestamp(i64),
	Sequence(u64),
}

impl CursorPosition {
	pub fn kind(&self) -> &'static str {
		match self {
			CursorPosition::BlockNumber(_) => "block_number",
			CursorPosition::Timestamp(_) => "timestamp",
			CursorPosition::Sequence(_) => "sequence",
		}
	}

	/// Ordering within the same variant; `None` across variants.
	pub fn partial_cmp_same_kind(&self, other: &CursorPosition) -> Option<std::cmp::Ordering> {
		match (self, other) {
			(CursorPosition::BlockNumber(a), CursorPosition::BlockNumber(b)) => Some(a.cmp(b)),
			(CursorPosition::Timestamp(a), CursorPosition::Timestamp(b)) => Some(a.cmp(b)),
			(CursorPosition::Sequence(a), CursorPosition::Sequence(b)) => Some(a.cmp(b)),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
	Completed,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorMetadata {
	pub provider_name: Option<String>,
	pub updated_at: DateTime<Utc>,
	pub is_complete: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub replay_window: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub fetch_status: Option<FetchStatus>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
}

/// Resumption token for one (account, operation stream).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
	pub primary: CursorPosition,
	pub last_transaction_id: Option<String>,
	pub total_fetched: u64,
	pub metadata: CursorMetadata,
}

impl Cursor {
	pub fn new(primary: CursorPosition, provider_name: Option<&str>) -> Self {
		Self {
			primary,
			last_transaction_id: None,
			total_fetched: 0,
			metadata: CursorMetadata {
				provider_name: provider_name.map(str::to_string),
				updated_at: Utc::now(),
				is_complete: false,
				replay_window: None,
				fetch_status: None,
				error_message: None,
			},
		}
	}

	/// Sentinel cursor recording that this stream's fetch failed. The next run
	/// retries from the previous position (or from scratch if there is none).
	pub fn failed_sentinel(
		previous: Option<&Cursor>,
		provider_name: Option<&str>,
		error_message: &str,
	) -> Self {
		let primary = previous
			.map(|c| c.primary.clone())
			.unwrap_or(CursorPosition::Sequence(0));
		Self {
			primary,
			last_transaction_id: Some(FETCH_FAILED_SENTINEL.to_string()),
			total_fetched: previous.map(|c| c.total_fetched).unwrap_or(0),
			metadata: CursorMetadata {
				provider_name: provider_name.map(str::to_string),
				updated_at: Utc::now(),
				is_complete: false,
				replay_window: None,
				fetch_status: Some(FetchStatus::Failed),
				error_message: Some(error_message.to_string()),
			},
		}
	}

	pub fn is_failed(&self) -> bool {
		self.metadata.fetch_status == Some(FetchStatus::Failed)
	}

	/// Structural checks applied before a cursor is persisted.
	pub fn validate(&self) -> Result<(), String> {
		if self.is_failed() {
			if self.last_transaction_id.as_deref() != Some(FETCH_FAILED_SENTINEL) {
				return Err(format!(
					"failed cursor must carry last_transaction_id={FETCH_FAILED_SENTINEL}"
				));
			}
			if self.metadata.error_message.as_deref().unwrap_or("").is_empty() {
				return Err("failed cursor must carry an error_message".to_string());
			}
		} else if self.last_transaction_id.as_deref() == Some(FETCH_FAILED_SENTINEL) {
			return Err(format!(
				"{FETCH_FAILED_SENTINEL} is reserved for failed-stream sentinels"
			));
		}
		Ok(())
	}

	/// Monotonicity rule: a healthy cursor must not regress a healthy
	/// predecessor. Failed sentinels may regress (they resume behind the
	/// replay window), and a variant change counts as a reset.
	pub fn allows_transition_from(&self, old: &Cursor) -> bool {
		if self.is_failed() {
			return true;
		}
		match self.primary.partial_cmp_same_kind(&old.primary) {
			Some(std::cmp::Ordering::Less) if !old.is_failed() => false,
			_ => true,
		}
	}
}
