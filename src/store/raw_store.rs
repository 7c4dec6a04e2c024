use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue};

use crate::types::{NewRawTransaction, ProcessingStatus, RawTransaction, TransactionKind};

use super::{Database, StoreError};

/// Append-only store of raw provider rows. Insertion is an upsert on the row
/// identity, so retries and overlapping replay windows are no-ops.
#[derive(Clone)]
pub struct RawStore {
	db: Database,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOutcome {
	pub inserted: u64,
	pub duplicates: u64,
}

/// Filters for `load`; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RawFilter {
	pub session_id: Option<i64>,
	pub source: Option<String>,
	pub status: Option<ProcessingStatus>,
	pub since: Option<DateTime<Utc>>,
}

impl RawFilter {
	pub fn for_session(session_id: i64) -> Self {
		Self { session_id: Some(session_id), ..Default::default() }
	}

	pub fn pending_for_session(session_id: i64) -> Self {
		Self {
			session_id: Some(session_id),
			status: Some(ProcessingStatus::Pending),
			..Default::default()
		}
	}
}

impl RawStore {
	pub fn new(db: Database) -> Self {
		Self { db }
	}

	/// Persist a batch for one session. Rows whose identity already exists
	/// are counted as duplicates and left untouched, including their
	/// processing status.
	pub async fn save(
		&self,
		session_id: i64,
		rows: &[NewRawTransaction],
	) -> Result<SaveOutcome, StoreError> {
		let rows = rows.to_vec();
		self.db
			.with_conn(move |conn| {
				let tx = conn.transaction()?;
				let mut outcome = SaveOutcome::default();
				{
					let mut stmt = tx.prepare(
						"INSERT OR IGNORE INTO raw_transactions
							(session_id, source_name, provider_name, venue_transaction_id,
							 transaction_type_hint, source_address, payload, normalized_preview,
							 event_id, processing_status, created_at)
						 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10)",
					)?;
					for row in &rows {
						let changed = stmt.execute(params![
							session_id,
							row.source_name,
							row.provider_name,
							row.venue_transaction_id,
							row.transaction_type_hint.as_str(),
							row.source_address,
							row.payload,
							row.normalized_preview,
							row.event_id(),
							Utc::now(),
						])?;
						if changed == 0 {
							outcome.duplicates += 1;
						} else {
							outcome.inserted += 1;
						}
					}
				}
				tx.commit()?;
				Ok(outcome)
			})
			.await
	}

	pub async fn load(&self, filter: RawFilter) -> Result<Vec<RawTransaction>, StoreError> {
		self.db
			.with_conn(move |conn| {
				let mut sql = String::from(
					"SELECT id, session_id, source_name, provider_name, venue_transaction_id,
						transaction_type_hint, source_address, payload, normalized_preview,
						event_id, processing_status, error, created_at
					 FROM raw_transactions WHERE 1=1",
				);
				let mut bind: Vec<SqlValue> = Vec::new();
				if let Some(session_id) = filter.session_id {
					sql.push_str(" AND session_id = ?");
					bind.push(SqlValue::Integer(session_id));
				}
				if let Some(source) = filter.source {
					sql.push_str(" AND source_name = ?");
					bind.push(SqlValue::Text(source));
				}
				if let Some(status) = filter.status {
					sql.push_str(" AND processing_status = ?");
					bind.push(SqlValue::Text(status.as_str().to_string()));
				}
				if let Some(since) = filter.since {
					sql.push_str(" AND created_at >= ?");
					bind.push(SqlValue::Text(since.to_rfc3339()));
				}
				sql.push_str(" ORDER BY id");

				let mut stmt = conn.prepare(&sql)?;
				let rows = stmt
					.query_map(params_from_iter(bind), row_to_raw)?
					.collect::<Result<Vec<_>, _>>()?;
				Ok(rows)
			})
			.await
	}

	/// One-way transition into `processed`, from `pending` or `failed`.
	pub async fn mark_processed(&self, ids: &[i64]) -> Result<u64, StoreError> {
		let ids = ids.to_vec();
		self.db
			.with_conn(move |conn| {
				let tx = conn.transaction()?;
				let mut affected = 0u64;
				{
					let mut stmt = tx.prepare(
						"UPDATE raw_transactions
						 SET processing_status = 'processed', error = NULL
						 WHERE id = ?1 AND processing_status IN ('pending', 'failed')",
					)?;
					for id in &ids {
						affected += stmt.execute(params![id])? as u64;
					}
				}
				tx.commit()?;
				Ok(affected)
			})
			.await
	}

	/// Quarantine one row with its failure reason. Processed rows stay
	/// processed.
	pub async fn mark_failed(&self, id: i64, error: &str) -> Result<bool, StoreError> {
		let error = error.to_string();
		self.db
			.with_conn(move |conn| {
				let affected = conn.execute(
					"UPDATE raw_transactions
					 SET processing_status = 'failed', error = ?2
					 WHERE id = ?1 AND processing_status = 'pending'",
					params![id, error],
				)?;
				Ok(affected > 0)
			})
			.await
	}
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> Result<RawTransaction, rusqlite::Error> {
	let hint: String = row.get(5)?;
	let status: String = row.get(10)?;
	Ok(RawTransaction {
		id: row.get(0)?,
		session_id: row.get(1)?,
		source_name: row.get(2)?,
		provider_name: row.get(3)?,
		venue_transaction_id: row.get(4)?,
		transaction_type_hint: TransactionKind::parse(&hint).ok_or_else(|| {
			rusqlite::Error::FromSqlConversionFailure(
				5,
				rusqlite::types::Type::Text,
				format!("unknown transaction kind {hint}").into(),
			)
		})?,
		source_address: row.get(6)?,
		payload: row.get(7)?,
		normalized_preview: row.get(8)?,
		event_id: row.get(9)?,
		processing_status: ProcessingStatus::parse(&status).ok_or_else(|| {
			rusqlite::Error::FromSqlConversionFailure(
				10,
				rusqlite::types::Type::Text,
				format!("unknown processing status {status}").into(),
			)
		})?,
		error: row.get(11)?,
		created_at: row.get(12)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::SessionRegistry;
	use crate::types::AccountSpec;
	use crate::types::AccountType;

	async fn setup() -> (RawStore, i64) {
		let db = Database::open_in_memory().unwrap();
		let accounts = crate::store::AccountRegistry::new(db.clone());
		let account = accounts
			.find_or_create(&AccountSpec::new(AccountType::Blockchain, "ethereum", "0xme"))
			.await
			.unwrap();
		let sessions = SessionRegistry::new(db.clone());
		let session = sessions.create(account.id).await.unwrap();
		(RawStore::new(db), session.id)
	}

	fn raw(id: &str) -> NewRawTransaction {
		NewRawTransaction {
			source_name: "ethereum".to_string(),
			provider_name: "etherscan".to_string(),
			venue_transaction_id: id.to_string(),
			transaction_type_hint: TransactionKind::Normal,
			source_address: Some("0xme".to_string()),
			payload: serde_json::json!({ "hash": id }),
			normalized_preview: None,
		}
	}

	#[tokio::test]
	async fn duplicate_insert_is_a_no_op() {
		let (store, session_id) = setup().await;
		let first = store.save(session_id, &[raw("0x1"), raw("0x2")]).await.unwrap();
		assert_eq!(first, SaveOutcome { inserted: 2, duplicates: 0 });

		let second = store.save(session_id, &[raw("0x1")]).await.unwrap();
		assert_eq!(second, SaveOutcome { inserted: 0, duplicates: 1 });

		let rows = store.load(RawFilter::for_session(session_id)).await.unwrap();
		assert_eq!(rows.len(), 2);
	}

	#[tokio::test]
	async fn same_venue_tx_from_other_provider_is_duplicate() {
		let (store, session_id) = setup().await;
		store.save(session_id, &[raw("0x1")]).await.unwrap();
		let mut other = raw("0x1");
		other.provider_name = "blockscout".to_string();
		let outcome = store.save(session_id, &[other]).await.unwrap();
		assert_eq!(outcome, SaveOutcome { inserted: 0, duplicates: 1 });
	}

	#[tokio::test]
	async fn processed_transition_is_one_way() {
		let (store, session_id) = setup().await;
		store.save(session_id, &[raw("0x1")]).await.unwrap();
		let rows = store.load(RawFilter::for_session(session_id)).await.unwrap();
		let id = rows[0].id;

		assert_eq!(store.mark_processed(&[id]).await.unwrap(), 1);
		// A processed row cannot be failed.
		assert!(!store.mark_failed(id, "late failure").await.unwrap());
		let rows = store.load(RawFilter::for_session(session_id)).await.unwrap();
		assert_eq!(rows[0].processing_status, ProcessingStatus::Processed);
		assert_eq!(rows[0].error, None);
	}

	#[tokio::test]
	async fn failed_rows_can_be_reprocessed() {
		let (store, session_id) = setup().await;
		store.save(session_id, &[raw("0x1")]).await.unwrap();
		let id = store.load(RawFilter::for_session(session_id)).await.unwrap()[0].id;

		assert!(store.mark_failed(id, "mapper blew up").await.unwrap());
		let failed = store
			.load(RawFilter {
				session_id: Some(session_id),
				status: Some(ProcessingStatus::Failed),
				..Default::default()
			})
			.await
			.unwrap();
		assert_eq!(failed.len(), 1);
		assert_eq!(failed[0].error.as_deref(), Some("mapper blew up"));

		assert_eq!(store.mark_processed(&[id]).await.unwrap(), 1);
	}

	#[tokio::test]
	async fn load_preserves_insertion_order() {
		let (store, session_id) = setup().await;
		let rows: Vec<_> = (0..5).map(|i| raw(&format!("0x{i}"))).collect();
		store.save(session_id, &rows).await.unwrap();
		let loaded = store.load(RawFilter::for_session(session_id)).await.unwrap();
		let ids: Vec<_> =
			loaded.iter().map(|r| r.venue_transaction_id.clone()).collect();
		assert_eq!(ids, vec!["0x0", "0x1", "0x2", "0x3", "0x4"]);
	}
}
