use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{
	CanonicalTransaction, Direction, Fee, FeeScope, FeeSettlement, Movement, Operation,
	OperationCategory, OperationType, Price, TransactionStatus,
};

use super::{Database, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
	Inserted,
	Updated,
}

/// Persists canonical transactions with their movements and fees in one
/// transaction. Upsert on (external_id, source); a retry writes the same
/// state, never a second row.
#[derive(Clone)]
pub struct CanonicalStore {
	db: Database,
}

impl CanonicalStore {
	pub fn new(db: Database) -> Self {
		Self { db }
	}

	pub async fn upsert(&self, tx: &CanonicalTransaction) -> Result<UpsertOutcome, StoreError> {
		let tx = tx.clone();
		self.db
			.with_conn(move |conn| {
				let dbtx = conn.transaction()?;
				let existing: Option<i64> = dbtx
					.query_row(
						"SELECT id FROM canonical_transactions
						 WHERE external_id = ?1 AND source = ?2",
						params![tx.external_id, tx.source],
						|row| row.get(0),
					)
					.optional()?;

				let (id, outcome) = match existing {
					Some(id) => {
						dbtx.execute(
							"UPDATE canonical_transactions
							 SET timestamp = ?2, datetime = ?3, status = ?4,
								 operation_category = ?5, operation_type = ?6, metadata = ?7
							 WHERE id = ?1",
							params![
								id,
								tx.timestamp,
								tx.datetime,
								tx.status.as_str(),
								tx.operation.category.as_str(),
								tx.operation.kind.as_str(),
								tx.metadata,
							],
						)?;
						dbtx.execute(
							"DELETE FROM movements WHERE transaction_id = ?1",
							params![id],
						)?;
						dbtx.execute("DELETE FROM fees WHERE transaction_id = ?1", params![id])?;
						(id, UpsertOutcome::Updated)
					},
					None => {
						dbtx.execute(
							"INSERT INTO canonical_transactions
								(external_id, source, timestamp, datetime, status,
								 operation_category, operation_type, metadata, created_at)
							 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
							params![
								tx.external_id,
								tx.source,
								tx.timestamp,
								tx.datetime,
								tx.status.as_str(),
								tx.operation.category.as_str(),
								tx.operation.kind.as_str(),
								tx.metadata,
								Utc::now(),
							],
						)?;
						(dbtx.last_insert_rowid(), UpsertOutcome::Inserted)
					},
				};

				{
					let mut stmt = dbtx.prepare(
						"INSERT INTO movements
							(transaction_id, movement_id, direction, asset, gross_amount,
							 net_amount, price_amount, price_currency, metadata)
						 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
					)?;
					for m in &tx.movements {
						let direction = match m.direction {
							Direction::Inflow => "inflow",
							Direction::Outflow => "outflow",
						};
						stmt.execute(params![
							id,
							m.movement_id,
							direction,
							m.asset,
							m.gross_amount.to_string(),
							m.net_amount.to_string(),
							m.price_at_tx_time.as_ref().map(|p| p.amount.to_string()),
							m.price_at_tx_time.as_ref().map(|p| p.currency.clone()),
							m.metadata,
						])?;
					}
				}
				{
					let mut stmt = dbtx.prepare(
						"INSERT INTO fees
							(transaction_id, amount, currency, scope, settlement,
							 funded_from_movement_id)
						 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
					)?;
					for f in &tx.fees {
						stmt.execute(params![
							id,
							f.amount.to_string(),
							f.currency,
							f.scope.as_str(),
							f.settlement.as_str(),
							f.funded_from_movement_id,
						])?;
					}
				}

				dbtx.commit()?;
				Ok(outcome)
			})
			.await
	}

	pub async fn find(
		&self,
		source: &str,
		external_id: &str,
	) -> Result<Option<CanonicalTransaction>, StoreError> {
		let source = source.to_string();
		let external_id = external_id.to_string();
		self.db
			.with_conn(move |conn| {
				let header = conn
					.query_row(
						"SELECT id, external_id, source, timestamp, datetime, status,
							operation_category, operation_type, metadata
						 FROM canonical_transactions
						 WHERE source = ?1 AND external_id = ?2",
						params![source, external_id],
						row_to_header,
					)
					.optional()?;
				let Some((id, mut tx)) = header else { return Ok(None) };
				tx.movements = load_movements(conn, id)?;
				tx.fees = load_fees(conn, id)?;
				Ok(Some(tx))
			})
			.await
	}

	pub async fn list_for_source(
		&self,
		source: &str,
	) -> Result<Vec<CanonicalTransaction>, StoreError> {
		let source = source.to_string();
		self.db
			.with_conn(move |conn| {
				let headers = {
					let mut stmt = conn.prepare(
						"SELECT id, external_id, source, timestamp, datetime, status,
							operation_category, operation_type, metadata
						 FROM canonical_transactions
						 WHERE source = ?1 ORDER BY timestamp, id",
					)?;
					let rows = stmt.query_map(params![source], row_to_header)?
						.collect::<Result<Vec<_>, _>>()?;
					rows
				};
				let mut out = Vec::with_capacity(headers.len());
				for (id, mut tx) in headers {
					tx.movements = load_movements(conn, id)?;
					tx.fees = load_fees(conn, id)?;
					out.push(tx);
				}
				Ok(out)
			})
			.await
	}

	pub async fn count(&self) -> Result<u64, StoreError> {
		self.db
			.with_conn(|conn| {
				let n: i64 = conn.query_row(
					"SELECT COUNT(*) FROM canonical_transactions",
					[],
					|row| row.get(0),
				)?;
				Ok(n as u64)
			})
			.await
	}
}

fn parse_decimal(column: usize, text: String) -> Result<BigDecimal, rusqlite::Error> {
	BigDecimal::from_str(&text).map_err(|e| {
		rusqlite::Error::FromSqlConversionFailure(
			column,
			rusqlite::types::Type::Text,
			format!("bad decimal {text}: {e}").into(),
		)
	})
}

fn row_to_header(
	row: &rusqlite::Row<'_>,
) -> Result<(i64, CanonicalTransaction), rusqlite::Error> {
	let status: String = row.get(5)?;
	let category: String = row.get(6)?;
	let kind: String = row.get(7)?;
	Ok((
		row.get(0)?,
		CanonicalTransaction {
			external_id: row.get(1)?,
			source: row.get(2)?,
			timestamp: row.get(3)?,
			datetime: row.get(4)?,
			status: TransactionStatus::parse(&status).unwrap_or(TransactionStatus::Ok),
			operation: Operation {
				category: OperationCategory::parse(&category).unwrap_or(OperationCategory::Other),
				kind: OperationType::parse(&kind).unwrap_or(OperationType::Other),
			},
			movements: Vec::new(),
			fees: Vec::new(),
			metadata: row.get(8)?,
		},
	))
}

fn load_movements(conn: &Connection, id: i64) -> Result<Vec<Movement>, rusqlite::Error> {
	let mut stmt = conn.prepare(
		"SELECT movement_id, direction, asset, gross_amount, net_amount,
			price_amount, price_currency, metadata
		 FROM movements WHERE transaction_id = ?1 ORDER BY id",
	)?;
	let rows = stmt.query_map(params![id], |row| {
		let direction: String = row.get(1)?;
		let gross: String = row.get(3)?;
		let net: String = row.get(4)?;
		let price_amount: Option<String> = row.get(5)?;
		let price_currency: Option<String> = row.get(6)?;
		Ok(Movement {
			movement_id: row.get(0)?,
			direction: if direction == "inflow" { Direction::Inflow } else { Direction::Outflow },
			asset: row.get(2)?,
			gross_amount: parse_decimal(3, gross)?,
			net_amount: parse_decimal(4, net)?,
			price_at_tx_time: match (price_amount, price_currency) {
				(Some(amount), Some(currency)) => {
					Some(Price { amount: parse_decimal(5, amount)?, currency })
				},
				_ => None,
			},
			metadata: row.get(7)?,
		})
	})?;
	rows.collect()
}

fn load_fees(conn: &Connection, id: i64) -> Result<Vec<Fee>, rusqlite::Error> {
	let mut stmt = conn.prepare(
		"SELECT amount, currency, scope, settlement, funded_from_movement_id
		 FROM fees WHERE transaction_id = ?1 ORDER BY id",
	)?;
	let rows = stmt.query_map(params![id], |row| {
		let amount: String = row.get(0)?;
		let scope: String = row.get(2)?;
		let settlement: String = row.get(3)?;
		Ok(Fee {
			amount: parse_decimal(0, amount)?,
			currency: row.get(1)?,
			scope: FeeScope::parse(&scope).unwrap_or(FeeScope::Other),
			settlement: FeeSettlement::parse(&settlement).unwrap_or(FeeSettlement::External),
			funded_from_movement_id: row.get(4)?,
		})
	})?;
	rows.collect()
}
