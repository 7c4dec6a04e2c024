use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::types::{ImportSession, SessionOutcome, SessionStatus};

use super::{Database, StoreError};

/// Records each import execution. Sessions are created `started` and
/// finalized exactly once; there is no reopen.
#[derive(Clone)]
pub struct SessionRegistry {
	db: Database,
}

impl SessionRegistry {
	pub fn new(db: Database) -> Self {
		Self { db }
	}

	pub async fn create(&self, account_id: i64) -> Result<ImportSession, StoreError> {
		self.db
			.with_conn(move |conn| {
				let correlation_id = Uuid::new_v4();
				let started_at = Utc::now();
				conn.execute(
					"INSERT INTO import_sessions (correlation_id, account_id, status, started_at)
					 VALUES (?1, ?2, 'started', ?3)",
					params![correlation_id.to_string(), account_id, started_at],
				)?;
				let id = conn.last_insert_rowid();
				tracing::info!(session_id = id, account_id, %correlation_id, "session started");
				Ok(ImportSession {
					id,
					correlation_id,
					account_id,
					status: SessionStatus::Started,
					started_at,
					completed_at: None,
					duration_ms: None,
					transactions_imported: 0,
					transactions_skipped: 0,
					error_message: None,
					error_details: None,
				})
			})
			.await
	}

	/// One-shot terminal transition. A second finalize attempt is a typed
	/// error, not a silent overwrite.
	pub async fn finalize(
		&self,
		session_id: i64,
		outcome: SessionOutcome,
	) -> Result<ImportSession, StoreError> {
		self.db
			.with_conn(move |conn| {
				let completed_at = Utc::now();
				let affected = conn.execute(
					"UPDATE import_sessions
					 SET status = ?2,
						 completed_at = ?3,
						 duration_ms = CAST(
							(julianday(?3) - julianday(started_at)) * 86400000 AS INTEGER),
						 transactions_imported = ?4,
						 transactions_skipped = ?5,
						 error_message = ?6,
						 error_details = ?7
					 WHERE id = ?1 AND status = 'started'",
					params![
						session_id,
						outcome.status.as_str(),
						completed_at,
						outcome.imported,
						outcome.skipped,
						outcome.error_message,
						outcome.error_details,
					],
				)?;
				if affected == 0 {
					let exists: Option<String> = conn
						.query_row(
							"SELECT status FROM import_sessions WHERE id = ?1",
							params![session_id],
							|row| row.get(0),
						)
						.optional()?;
					return Err(match exists {
						Some(_) => StoreError::SessionAlreadyFinalized { session_id },
						None => StoreError::NotFound {
							entity: "import session",
							id: session_id.to_string(),
						},
					});
				}
				let session = get_session(conn, session_id)?;
				tracing::info!(
					session_id,
					status = session.status.as_str(),
					imported = session.transactions_imported,
					skipped = session.transactions_skipped,
					duration_ms = session.duration_ms,
					"session finalized"
				);
				Ok(session)
			})
			.await
	}

	pub async fn get(&self, session_id: i64) -> Result<ImportSession, StoreError> {
		self.db.with_conn(move |conn| get_session(conn, session_id)).await
	}
}

fn get_session(conn: &rusqlite::Connection, session_id: i64) -> Result<ImportSession, StoreError> {
	conn.query_row(
		"SELECT id, correlation_id, account_id, status, started_at, completed_at,
			duration_ms, transactions_imported, transactions_skipped,
			error_message, error_details
		 FROM import_sessions WHERE id = ?1",
		params![session_id],
		row_to_session,
	)
	.optional()?
	.ok_or(StoreError::NotFound { entity: "import session", id: session_id.to_string() })
}

pub(crate) fn row_to_session(row: &Row<'_>) -> Result<ImportSession, rusqlite::Error> {
	let correlation: String = row.get(1)?;
	let status: String = row.get(3)?;
	let conversion = |column: usize, message: String| {
		rusqlite::Error::FromSqlConversionFailure(
			column,
			rusqlite::types::Type::Text,
			message.into(),
		)
	};
	Ok(ImportSession {
		id: row.get(0)?,
		correlation_id: Uuid::parse_str(&correlation)
			.map_err(|e| conversion(1, format!("bad correlation id: {e}")))?,
		account_id: row.get(2)?,
		status: SessionStatus::parse(&status)
			.ok_or_else(|| conversion(3, format!("unknown session status {status}")))?,
		started_at: row.get(4)?,
		completed_at: row.get(5)?,
		duration_ms: row.get(6)?,
		transactions_imported: row.get(7)?,
		transactions_skipped: row.get(8)?,
		error_message: row.get(9)?,
		error_details: row.get(10)?,
	})
}

#[cfg(test)]
mod tests {
	use crate::{store::AccountRegistry, types::AccountSpec, types::AccountType};

	use super::*;

	async fn setup() -> (SessionRegistry, i64) {
		let db = Database::open_in_memory().unwrap();
		let accounts = AccountRegistry::new(db.clone());
		let account = accounts
			.find_or_create(&AccountSpec::new(AccountType::ExchangeCsv, "binance", "./a.csv"))
			.await
			.unwrap();
		(SessionRegistry::new(db), account.id)
	}

	#[tokio::test]
	async fn finalize_records_counts_and_duration() {
		let (sessions, account_id) = setup().await;
		let session = sessions.create(account_id).await.unwrap();
		tokio::time::sleep(std::time::Duration::from_millis(10)).await;

		let finalized =
			sessions.finalize(session.id, SessionOutcome::completed(5, 2)).await.unwrap();
		assert_eq!(finalized.status, SessionStatus::Completed);
		assert_eq!(finalized.transactions_imported, 5);
		assert_eq!(finalized.transactions_skipped, 2);
		assert!(finalized.completed_at.is_some());
		assert!(finalized.duration_ms.unwrap() >= 10);
	}

	#[tokio::test]
	async fn finalize_is_one_shot() {
		let (sessions, account_id) = setup().await;
		let session = sessions.create(account_id).await.unwrap();
		sessions.finalize(session.id, SessionOutcome::completed(1, 0)).await.unwrap();

		let err = sessions
			.finalize(session.id, SessionOutcome::failed("again", None))
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::SessionAlreadyFinalized { .. }));

		// First terminal state is untouched.
		let session = sessions.get(session.id).await.unwrap();
		assert_eq!(session.status, SessionStatus::Completed);
		assert_eq!(session.transactions_imported, 1);
	}

	#[tokio::test]
	async fn failed_outcome_keeps_error_details() {
		let (sessions, account_id) = setup().await;
		let session = sessions.create(account_id).await.unwrap();
		let details = serde_json::json!({ "code": "CREDENTIALS_REJECTED" });
		let finalized = sessions
			.finalize(
				session.id,
				SessionOutcome::failed("api key rejected", Some(details.clone())),
			)
			.await
			.unwrap();
		assert_eq!(finalized.error_message.as_deref(), Some("api key rejected"));
		assert_eq!(finalized.error_details, Some(details));
	}

	#[tokio::test]
	async fn unknown_session_is_not_found() {
		let (sessions, _) = setup().await;
		assert!(matches!(
			sessions.finalize(999, SessionOutcome::completed(0, 0)).await.unwrap_err(),
			StoreError::NotFound { .. }
		));
	}
}
