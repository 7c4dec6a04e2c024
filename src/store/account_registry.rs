use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::types::{
	Account, AccountPatch, AccountSpec, AccountType, Cursor, ImportSession, VerificationMetadata,
};

use super::{session_registry::row_to_session, Database, SessionLockGuard, SessionLocks, StoreError};

/// Idempotent account identity plus cursor maintenance. Also hands out the
/// per-account session lock: one live import per account, process-wide when
/// all sessions share one registry instance (they do; it's cheaply cloned).
#[derive(Clone)]
pub struct AccountRegistry {
	db: Database,
	locks: Arc<SessionLocks>,
}

const ACCOUNT_COLUMNS: &str = "id, user_id, account_type, source_name, identifier, \
	parent_account_id, provider_name, credentials, last_cursor, verification, \
	created_at, updated_at";

impl AccountRegistry {
	pub fn new(db: Database) -> Self {
		Self { db, locks: Arc::new(SessionLocks::default()) }
	}

	/// Acquire the single-session lock for an account. Fails immediately
	/// with a typed error when a session is already running.
	pub fn lock_session(&self, account_id: i64) -> Result<SessionLockGuard, StoreError> {
		self.locks.acquire(account_id)
	}

	/// Find by the identity tuple or create. A `None` user id matches only
	/// stored NULL rows. The non-identity spec fields apply on creation only.
	pub async fn find_or_create(&self, spec: &AccountSpec) -> Result<Account, StoreError> {
		let spec = spec.clone();
		self.db
			.with_conn(move |conn| {
				let existing = conn
					.query_row(
						&format!(
							"SELECT {ACCOUNT_COLUMNS} FROM accounts
							 WHERE account_type = ?1 AND source_name = ?2 AND identifier = ?3
							   AND ((user_id IS NULL AND ?4 IS NULL) OR user_id = ?4)"
						),
						params![
							spec.account_type.as_str(),
							spec.source_name,
							spec.identifier,
							spec.user_id,
						],
						row_to_account,
					)
					.optional()?;
				if let Some(account) = existing {
					return Ok(account);
				}

				let now = Utc::now();
				conn.execute(
					"INSERT INTO accounts
						(user_id, account_type, source_name, identifier, parent_account_id,
						 provider_name, credentials, last_cursor, verification,
						 created_at, updated_at)
					 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', NULL, ?8, ?8)",
					params![
						spec.user_id,
						spec.account_type.as_str(),
						spec.source_name,
						spec.identifier,
						spec.parent_account_id,
						spec.provider_name,
						spec.credentials,
						now,
					],
				)?;
				let id = conn.last_insert_rowid();
				tracing::info!(
					account_id = id,
					source = %spec.source_name,
					account_type = spec.account_type.as_str(),
					"account created"
				);
				conn.query_row(
					&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
					params![id],
					row_to_account,
				)
				.map_err(StoreError::from)
			})
			.await
	}

	pub async fn get(&self, id: i64) -> Result<Account, StoreError> {
		self.db
			.with_conn(move |conn| {
				conn.query_row(
					&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
					params![id],
					row_to_account,
				)
				.optional()?
				.ok_or(StoreError::NotFound { entity: "account", id: id.to_string() })
			})
			.await
	}

	/// Apply a partial update. Unsupplied fields are untouched; `updated_at`
	/// advances only when a supplied field actually changed.
	pub async fn update(&self, id: i64, patch: AccountPatch) -> Result<Account, StoreError> {
		self.db
			.with_conn(move |conn| {
				let current = conn
					.query_row(
						&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
						params![id],
						row_to_account,
					)
					.optional()?
					.ok_or(StoreError::NotFound { entity: "account", id: id.to_string() })?;

				let mut next = current.clone();
				if let Some(provider_name) = patch.provider_name {
					next.provider_name = Some(provider_name);
				}
				if let Some(credentials) = patch.credentials {
					next.credentials = Some(credentials);
				}
				if let Some(verification) = patch.verification {
					next.verification = Some(verification);
				}
				if let Some(parent_account_id) = patch.parent_account_id {
					next.parent_account_id = Some(parent_account_id);
				}
				if next == current {
					return Ok(current);
				}

				next.updated_at = Utc::now();
				conn.execute(
					"UPDATE accounts
					 SET provider_name = ?2, credentials = ?3, verification = ?4,
						 parent_account_id = ?5, updated_at = ?6
					 WHERE id = ?1",
					params![
						id,
						next.provider_name,
						next.credentials,
						serde_json::to_string(&next.verification)
							.ok()
							.filter(|_| next.verification.is_some()),
						next.parent_account_id,
						next.updated_at,
					],
				)?;
				Ok(next)
			})
			.await
	}

	/// Merge one stream's cursor into the per-operation map. Rejects cursors
	/// failing schema validation and healthy cursors that would regress a
	/// healthy predecessor.
	pub async fn update_cursor(
		&self,
		id: i64,
		stream_key: &str,
		cursor: Cursor,
	) -> Result<(), StoreError> {
		if let Err(message) = cursor.validate() {
			return Err(StoreError::InvalidCursor { stream_key: stream_key.to_string(), message });
		}
		let stream_key = stream_key.to_string();
		self.db
			.with_conn(move |conn| {
				let raw: Option<String> = conn
					.query_row(
						"SELECT last_cursor FROM accounts WHERE id = ?1",
						params![id],
						|row| row.get(0),
					)
					.optional()?;
				let raw = raw
					.ok_or(StoreError::NotFound { entity: "account", id: id.to_string() })?;
				let mut cursors: BTreeMap<String, Cursor> = serde_json::from_str(&raw)?;

				if let Some(previous) = cursors.get(&stream_key) {
					if !cursor.allows_transition_from(previous) {
						return Err(StoreError::CursorRegression {
							stream_key: stream_key.clone(),
							message: format!(
								"{:?} -> {:?} without a failed-fetch sentinel",
								previous.primary, cursor.primary
							),
						});
					}
				}

				cursors.insert(stream_key, cursor);
				conn.execute(
					"UPDATE accounts SET last_cursor = ?2, updated_at = ?3 WHERE id = ?1",
					params![id, serde_json::to_string(&cursors)?, Utc::now()],
				)?;
				Ok(())
			})
			.await
	}

	/// Newest resumable session for the account: status started or failed.
	pub async fn find_latest_incomplete(
		&self,
		account_id: i64,
	) -> Result<Option<ImportSession>, StoreError> {
		self.db
			.with_conn(move |conn| {
				conn.query_row(
					"SELECT id, correlation_id, account_id, status, started_at, completed_at,
						duration_ms, transactions_imported, transactions_skipped,
						error_message, error_details
					 FROM import_sessions
					 WHERE account_id = ?1 AND status IN ('started', 'failed')
					 ORDER BY started_at DESC, id DESC LIMIT 1",
					params![account_id],
					row_to_session,
				)
				.optional()
				.map_err(StoreError::from)
			})
			.await
	}

	/// Derived child accounts of an xpub parent.
	pub async fn children_of(&self, parent_id: i64) -> Result<Vec<Account>, StoreError> {
		self.db
			.with_conn(move |conn| {
				let mut stmt = conn.prepare(&format!(
					"SELECT {ACCOUNT_COLUMNS} FROM accounts
					 WHERE parent_account_id = ?1 ORDER BY id"
				))?;
				let accounts = stmt
					.query_map(params![parent_id], row_to_account)?
					.collect::<Result<Vec<_>, _>>()?;
				Ok(accounts)
			})
			.await
	}
}

fn row_to_account(row: &Row<'_>) -> Result<Account, rusqlite::Error> {
	let account_type: String = row.get(2)?;
	let last_cursor: String = row.get(8)?;
	let verification: Option<String> = row.get(9)?;
	let conversion = |column: usize, message: String| {
		rusqlite::Error::FromSqlConversionFailure(
			column,
			rusqlite::types::Type::Text,
			message.into(),
		)
	};
	Ok(Account {
		id: row.get(0)?,
		user_id: row.get(1)?,
		account_type: AccountType::parse(&account_type)
			.ok_or_else(|| conversion(2, format!("unknown account type {account_type}")))?,
		source_name: row.get(3)?,
		identifier: row.get(4)?,
		parent_account_id: row.get(5)?,
		provider_name: row.get(6)?,
		credentials: row.get(7)?,
		last_cursor: serde_json::from_str(&last_cursor)
			.map_err(|e| conversion(8, format!("bad cursor map: {e}")))?,
		verification: verification
			.map(|v| {
				serde_json::from_str::<VerificationMetadata>(&v)
					.map_err(|e| conversion(9, format!("bad verification blob: {e}")))
			})
			.transpose()?,
		created_at: row.get(10)?,
		updated_at: row.get(11)?,
	})
}
