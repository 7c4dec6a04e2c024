use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
	Started,
	Completed,
	Failed,
	Cancelled,
}

impl SessionStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			SessionStatus::Started => "started",
			SessionStatus::Completed => "completed",
			SessionStatus::Failed => "failed",
			SessionStatus::Cancelled => "cancelled",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"started" => Some(SessionStatus::Started),
			"completed" => Some(SessionStatus::Completed),
			"failed" => Some(SessionStatus::Failed),
			"cancelled" => Some(SessionStatus::Cancelled),
			_ => None,
		}
	}

	pub fn is_terminal(&self) -> bool {
		!matches!(self, SessionStatus::Started)
	}
}

/// One execution of the ingestion pipeline against one account. Created in
/// `started`, finalized exactly once into a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSession {
	pub id: i64,
	/// Stable id used to correlate log lines and error reports across runs.
	pub correlation_id: Uuid,
	pub account_id: i64,
	pub status: SessionStatus,
	pub started_at: DateTime<Utc>,
	pub completed_at: Option<DateTime<Utc>>,
	pub duration_ms: Option<i64>,
	pub transactions_imported: i64,
	pub transactions_skipped: i64,
	pub error_message: Option<String>,
	pub error_details: Option<serde_json::Value>,
}

/// Terminal state handed to the session registry's one-shot finalize.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
	pub status: SessionStatus,
	pub imported: i64,
	pub skipped: i64,
	pub error_message: Option<String>,
	pub error_details: Option<serde_json::Value>,
}

impl SessionOutcome {
	pub fn completed(imported: i64, skipped: i64) -> Self {
		Self {
			status: SessionStatus::Completed,
			imported,
			skipped,
			error_message: None,
			error_details: None,
		}
	}

	pub fn failed(message: &str, details: Option<serde_json::Value>) -> Self {
		Self {
			status: SessionStatus::Failed,
			imported: 0,
			skipped: 0,
			error_message: Some(message.to_string()),
			error_details: details,
		}
	}

	pub fn cancelled(imported: i64, skipped: i64) -> Self {
		Self {
			status: SessionStatus::Cancelled,
			imported,
			skipped,
			error_message: None,
			error_details: None,
		}
	}
}
