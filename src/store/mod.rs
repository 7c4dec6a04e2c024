//! SQLite-backed persistence: raw rows, canonical transactions, accounts,
//! sessions and currencies share one connection behind an async mutex.

pub mod account_registry;
pub mod canonical_store;
pub mod currency_registry;
mod migrations;
pub mod raw_store;
pub mod session_registry;

use std::{
	collections::HashSet,
	path::Path,
	sync::{Arc, Mutex},
};

use rusqlite::Connection;
use thiserror::Error;

pub use account_registry::AccountRegistry;
pub use canonical_store::{CanonicalStore, UpsertOutcome};
pub use currency_registry::CurrencyRegistry;
pub use raw_store::{RawFilter, RawStore, SaveOutcome};
pub use session_registry::SessionRegistry;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error(transparent)]
	Sqlite(#[from] rusqlite::Error),

	#[error(transparent)]
	Serialization(#[from] serde_json::Error),

	#[error("a session is already active for account {account_id}")]
	SessionAlreadyActive { account_id: i64 },

	#[error("session {session_id} is already finalized")]
	SessionAlreadyFinalized { session_id: i64 },

	#[error("invalid cursor for stream {stream_key}: {message}")]
	InvalidCursor { stream_key: String, message: String },

	#[error("cursor for stream {stream_key} would regress: {message}")]
	CursorRegression { stream_key: String, message: String },

	#[error("{entity} {id} not found")]
	NotFound { entity: &'static str, id: String },
}

impl StoreError {
	pub fn code(&self) -> &'static str {
		match self {
			StoreError::Sqlite(_) => "SQLITE_ERROR",
			StoreError::Serialization(_) => "SERIALIZATION_ERROR",
			StoreError::SessionAlreadyActive { .. } => "SESSION_ALREADY_ACTIVE",
			StoreError::SessionAlreadyFinalized { .. } => "SESSION_ALREADY_FINALIZED",
			StoreError::InvalidCursor { .. } => "INVALID_CURSOR",
			StoreError::CursorRegression { .. } => "CURSOR_REGRESSION",
			StoreError::NotFound { .. } => "NOT_FOUND",
		}
	}
}

/// Handle to the engine database. Cheap to clone; all stores built from the
/// same handle share one connection, so store writes serialize naturally.
#[derive(Clone)]
pub struct Database {
	conn: Arc<tokio::sync::Mutex<Connection>>,
}

impl Database {
	pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
		Self::from_connection(Connection::open(path)?)
	}

	pub fn open_in_memory() -> Result<Self, StoreError> {
		Self::from_connection(Connection::open_in_memory()?)
	}

	fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
		conn.pragma_update(None, "journal_mode", "WAL")?;
		conn.pragma_update(None, "foreign_keys", true)?;
		migrations::migrate(&mut conn)?;
		Ok(Self { conn: Arc::new(tokio::sync::Mutex::new(conn)) })
	}

	/// Run a closure against the connection. Queries are short; the lock is
	/// the suspension point, the work inside is not.
	pub(crate) async fn with_conn<T>(
		&self,
		f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
	) -> Result<T, StoreError> {
		let mut conn = self.conn.lock().await;
		f(&mut conn)
	}
}

/// In-process lock map enforcing one live session per account.
#[derive(Default)]
pub struct SessionLocks {
	held: Mutex<HashSet<i64>>,
}

impl SessionLocks {
	pub fn acquire(self: &Arc<Self>, account_id: i64) -> Result<SessionLockGuard, StoreError> {
		let mut held = self.held.lock().expect("session lock poisoned");
		if !held.insert(account_id) {
			return Err(StoreError::SessionAlreadyActive { account_id });
		}
		Ok(SessionLockGuard { account_id, locks: Arc::clone(self) })
	}
}

/// Released on drop, so a panicking session cannot wedge its account.
pub struct SessionLockGuard {
	account_id: i64,
	locks: Arc<SessionLocks>,
}

impl Drop for SessionLockGuard {
	fn drop(&mut self) {
		self.locks
			.held
			.lock()
			.expect("session lock poisoned")
			.remove(&self.account_id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn database_opens_and_migrates_in_memory() {
		let db = Database::open_in_memory().unwrap();
		let tables: Vec<String> = db
			.with_conn(|conn| {
				let mut stmt = conn
					.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
				let names = stmt
					.query_map([], |row| row.get(0))?
					.collect::<Result<Vec<String>, _>>()?;
				Ok(names)
			})
			.await
			.unwrap();
		for expected in [
			"accounts",
			"canonical_transactions",
			"currencies",
			"fees",
			"import_sessions",
			"movements",
			"raw_transactions",
		] {
			assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
		}
	}

	#[test]
	fn second_session_lock_for_same_account_is_rejected() {
		let locks = Arc::new(SessionLocks::default());
		let guard = locks.acquire(7).unwrap();
		assert!(matches!(
			locks.acquire(7),
			Err(StoreError::SessionAlreadyActive { account_id: 7 })
		));
		drop(guard);
		assert!(locks.acquire(7).is_ok());
	}

	#[test]
	fn locks_are_per_account() {
		let locks = Arc::new(SessionLocks::default());
		let _a = locks.acquire(1).unwrap();
		assert!(locks.acquire(2).is_ok());
	}
}
