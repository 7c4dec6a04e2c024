use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cursor::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountType {
	Blockchain,
	ExchangeApi,
	ExchangeCsv,
}

impl AccountType {
	pub fn as_str(&self) -> &'static str {
		match self {
			AccountType::Blockchain => "blockchain",
			AccountType::ExchangeApi => "exchange-api",
			AccountType::ExchangeCsv => "exchange-csv",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"blockchain" => Some(AccountType::Blockchain),
			"exchange-api" => Some(AccountType::ExchangeApi),
			"exchange-csv" => Some(AccountType::ExchangeCsv),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationMetadata {
	pub verified_at: DateTime<Utc>,
	pub method: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<serde_json::Value>,
}

/// A venue identity the engine imports for. The identity tuple
/// (account_type, source_name, identifier, user_id) is unique; everything
/// else is mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
	pub id: i64,
	pub user_id: Option<String>,
	pub account_type: AccountType,
	pub source_name: String,
	/// Address, xpub, API-key label or CSV path, depending on account_type.
	pub identifier: String,
	pub parent_account_id: Option<i64>,
	pub provider_name: Option<String>,
	/// Opaque to the engine; only adapters know the schema.
	pub credentials: Option<serde_json::Value>,
	/// Per operation-stream resumption state, keyed by stream key.
	pub last_cursor: BTreeMap<String, Cursor>,
	pub verification: Option<VerificationMetadata>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Account {
	pub fn cursor_for(&self, stream_key: &str) -> Option<&Cursor> {
		self.last_cursor.get(stream_key)
	}

	/// True when any stored stream cursor is a failed-fetch sentinel.
	pub fn has_failed_streams(&self) -> bool {
		self.last_cursor.values().any(Cursor::is_failed)
	}
}

/// Input to `find_or_create`. Matches an existing account on the identity
/// tuple; the remaining fields only apply on first creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSpec {
	pub user_id: Option<String>,
	pub account_type: AccountType,
	pub source_name: String,
	pub identifier: String,
	pub parent_account_id: Option<i64>,
	pub credentials: Option<serde_json::Value>,
	pub provider_name: Option<String>,
}

impl AccountSpec {
	pub fn new(account_type: AccountType, source_name: &str, identifier: &str) -> Self {
		Self {
			user_id: None,
			account_type,
			source_name: source_name.to_string(),
			identifier: identifier.to_string(),
			parent_account_id: None,
			credentials: None,
			provider_name: None,
		}
	}

	pub fn with_user(mut self, user_id: &str) -> Self {
		self.user_id = Some(user_id.to_string());
		self
	}

	pub fn with_parent(mut self, parent_account_id: i64) -> Self {
		self.parent_account_id = Some(parent_account_id);
		self
	}

	pub fn with_credentials(mut self, credentials: serde_json::Value) -> Self {
		self.credentials = Some(credentials);
		self
	}

	pub fn with_provider(mut self, provider_name: &str) -> Self {
		self.provider_name = Some(provider_name.to_string());
		self
	}
}

/// Partial update. `None` fields are left untouched; `updated_at` only
/// advances when a supplied field actually differs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountPatch {
	pub provider_name: Option<String>,
	pub credentials: Option<serde_json::Value>,
	pub verification: Option<VerificationMetadata>,
	pub parent_account_id: Option<i64>,
}

impl AccountPatch {
	pub fn is_empty(&self) -> bool {
		self.provider_name.is_none()
			&& self.credentials.is_none()
			&& self.verification.is_none()
			&& self.parent_account_id.is_none()
	}
}
