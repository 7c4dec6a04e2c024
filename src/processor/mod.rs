//! Transforms raw venue rows into canonical transactions.
//!
//! Mapping is a registry of pure per-(source, provider) mappers. The
//! processor groups correlated rows, runs the mapper, validates the result
//! and persists it; rows that fail are quarantined individually while the
//! rest of the batch proceeds.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;

use crate::{
	store::{CanonicalStore, CurrencyRegistry, RawFilter, RawStore, StoreError},
	types::{CanonicalTransaction, Currency, RawTransaction, ValidationError},
};

/// Session context handed to mappers. Mappers are pure with respect to it:
/// same rows + same metadata always produce the same canonical transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMetadata {
	pub session_id: i64,
	pub account_id: i64,
	pub source_name: String,
	/// The account identifier: address, xpub, API-key label or CSV path.
	pub identifier: String,
	pub user_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum MappingError {
	#[error("no mapper registered for ({source_name}, {provider})")]
	NoMapper { source_name: String, provider: String },

	#[error("missing field {field}")]
	MissingField { field: &'static str },

	#[error("invalid decimal in {field}: {value}")]
	InvalidDecimal { field: &'static str, value: String },

	#[error("invalid timestamp: {value}")]
	InvalidTimestamp { value: String },

	#[error("unrecognized row: {message}")]
	UnrecognizedRow { message: String },

	#[error("correlated group is incomplete: {message}")]
	IncompleteGroup { message: String },

	#[error(transparent)]
	Invariant(#[from] ValidationError),
}

impl MappingError {
	pub fn code(&self) -> &'static str {
		match self {
			MappingError::NoMapper { .. } => "NO_MAPPER",
			MappingError::MissingField { .. } => "MISSING_FIELD",
			MappingError::InvalidDecimal { .. } => "INVALID_DECIMAL",
			MappingError::InvalidTimestamp { .. } => "INVALID_TIMESTAMP",
			MappingError::UnrecognizedRow { .. } => "UNRECOGNIZED_ROW",
			MappingError::IncompleteGroup { .. } => "INCOMPLETE_GROUP",
			MappingError::Invariant(e) => e.code(),
		}
	}
}

/// Pure venue-row → canonical mapping. No I/O, no global state.
pub trait TransactionMapper: Send + Sync {
	/// Key grouping venue rows that form one logical transaction (e.g. the
	/// two legs of a convert). `None` maps the row on its own.
	fn correlation_key(&self, row: &RawTransaction) -> Option<String> {
		let _ = row;
		None
	}

	/// Map one correlated group (usually a single row). `Ok(None)` is an
	/// intentional skip, e.g. a venue-internal transfer.
	fn map(
		&self,
		rows: &[RawTransaction],
		session: &SessionMetadata,
	) -> Result<Option<CanonicalTransaction>, MappingError>;

	/// Currencies referenced by a mapped transaction, with venue-known
	/// decimals. The default guesses 8 decimals; mappers that know better
	/// override this.
	fn currencies(
		&self,
		rows: &[RawTransaction],
		tx: &CanonicalTransaction,
	) -> Vec<Currency> {
		let _ = rows;
		let mut out: Vec<Currency> = Vec::new();
		let mut push = |symbol: &str| {
			if !out.iter().any(|c| c.symbol == symbol) {
				out.push(Currency::crypto(symbol, 8));
			}
		};
		for m in &tx.movements {
			push(&m.asset);
		}
		for f in &tx.fees {
			push(&f.currency);
		}
		out
	}
}

/// Compile-time wired mapper registry, dispatched by (source, provider).
#[derive(Default)]
pub struct MapperRegistry {
	mappers: HashMap<(String, String), Arc<dyn TransactionMapper>>,
}

impl MapperRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(
		&mut self,
		source: &str,
		provider: &str,
		mapper: Arc<dyn TransactionMapper>,
	) {
		self.mappers.insert((source.to_string(), provider.to_string()), mapper);
	}

	pub fn get(&self, source: &str, provider: &str) -> Option<Arc<dyn TransactionMapper>> {
		self.mappers.get(&(source.to_string(), provider.to_string())).cloned()
	}
}

/// One quarantined group, with enough detail for later inspection.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RowFailure {
	pub raw_ids: Vec<i64>,
	pub venue_transaction_id: String,
	pub code: String,
	pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
	pub imported: u64,
	pub skipped: u64,
	pub failed: u64,
	pub failures: Vec<RowFailure>,
}

pub struct Processor {
	registry: Arc<MapperRegistry>,
	raw: RawStore,
	canonical: CanonicalStore,
	currencies: CurrencyRegistry,
}

impl Processor {
	pub fn new(
		registry: Arc<MapperRegistry>,
		raw: RawStore,
		canonical: CanonicalStore,
		currencies: CurrencyRegistry,
	) -> Self {
		Self { registry, raw, canonical, currencies }
	}

	/// Drain this session's pending rows into the canonical store. Mapping
	/// failures quarantine their group and the batch continues.
	pub async fn process_session(
		&self,
		session_id: i64,
		session: &SessionMetadata,
	) -> Result<ProcessOutcome, StoreError> {
		let rows = self.raw.load(RawFilter::pending_for_session(session_id)).await?;
		let groups = self.correlate(rows);

		let mut outcome = ProcessOutcome::default();
		for group in groups {
			let Some(mapper) =
				self.registry.get(&group.rows[0].source_name, &group.rows[0].provider_name)
			else {
				let error = MappingError::NoMapper {
					source_name: group.rows[0].source_name.clone(),
					provider: group.rows[0].provider_name.clone(),
				};
				self.quarantine(&group.rows, &error, &mut outcome).await?;
				continue;
			};

			match mapper.map(&group.rows, session).and_then(|mapped| match mapped {
				Some(tx) => {
					tx.validate()?;
					Ok(Some(tx))
				},
				None => Ok(None),
			}) {
				Ok(Some(tx)) => {
					for currency in mapper.currencies(&group.rows, &tx) {
						self.currencies.ensure(&currency).await?;
					}
					self.canonical.upsert(&tx).await?;
					self.raw
						.mark_processed(&group.rows.iter().map(|r| r.id).collect::<Vec<_>>())
						.await?;
					outcome.imported += 1;
				},
				Ok(None) => {
					self.raw
						.mark_processed(&group.rows.iter().map(|r| r.id).collect::<Vec<_>>())
						.await?;
					outcome.skipped += 1;
				},
				Err(error) => {
					self.quarantine(&group.rows, &error, &mut outcome).await?;
				},
			}
		}

		tracing::info!(
			session_id,
			imported = outcome.imported,
			skipped = outcome.skipped,
			failed = outcome.failed,
			"processed session rows"
		);
		Ok(outcome)
	}

	/// Group rows by mapper-defined correlation key, preserving first-seen
	/// order. Rows without a key stay singleton groups.
	fn correlate(&self, rows: Vec<RawTransaction>) -> Vec<RowGroup> {
		let mut groups: Vec<RowGroup> = Vec::new();
		let mut index_by_key: HashMap<(String, String), usize> = HashMap::new();

		for row in rows {
			let key = self
				.registry
				.get(&row.source_name, &row.provider_name)
				.and_then(|mapper| mapper.correlation_key(&row));
			match key {
				Some(key) => {
					let full_key = (row.provider_name.clone(), key);
					match index_by_key.get(&full_key) {
						Some(&i) => groups[i].rows.push(row),
						None => {
							index_by_key.insert(full_key, groups.len());
							groups.push(RowGroup { rows: vec![row] });
						},
					}
				},
				None => groups.push(RowGroup { rows: vec![row] }),
			}
		}
		groups
	}

	async fn quarantine(
		&self,
		rows: &[RawTransaction],
		error: &MappingError,
		outcome: &mut ProcessOutcome,
	) -> Result<(), StoreError> {
		let message = error.to_string();
		tracing::warn!(
			venue_tx = %rows[0].venue_transaction_id,
			code = error.code(),
			%message,
			"quarantined raw group"
		);
		for row in rows {
			self.raw.mark_failed(row.id, &message).await?;
		}
		outcome.failed += 1;
		outcome.failures.push(RowFailure {
			raw_ids: rows.iter().map(|r| r.id).collect(),
			venue_transaction_id: rows[0].venue_transaction_id.clone(),
			code: error.code().to_string(),
			message,
		});
		Ok(())
	}
}

struct RowGroup {
	rows: Vec<RawTransaction>,
}

#[cfg(test)]
mod tests {
	use std::str::FromStr;

	use bigdecimal::BigDecimal;
	use chrono::{TimeZone, Utc};

	use crate::{
		store::{AccountRegistry, Database, SessionRegistry},
		types::{
			AccountSpec, AccountType, Movement, NewRawTransaction, Operation, OperationType,
			ProcessingStatus, TransactionKind, TransactionStatus,
		},
	};

	use super::*;

	/// Maps `{ "amount": "..", "asset": "..", "direction": "in"|"out" }`
	/// deposit/withdrawal payloads; rows tagged with a `pair` field are
	/// correlated into one swap.
	struct TestMapper;

	impl TransactionMapper for TestMapper {
		fn correlation_key(&self, row: &RawTransaction) -> Option<String> {
			row.payload.get("pair").and_then(|v| v.as_str()).map(str::to_string)
		}

		fn map(
			&self,
			rows: &[RawTransaction],
			session: &SessionMetadata,
		) -> Result<Option<CanonicalTransaction>, MappingError> {
			let datetime = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
			let movement_of = |row: &RawTransaction| -> Result<Movement, MappingError> {
				let asset = row
					.payload
					.get("asset")
					.and_then(|v| v.as_str())
					.ok_or(MappingError::MissingField { field: "asset" })?;
				let amount = row
					.payload
					.get("amount")
					.and_then(|v| v.as_str())
					.ok_or(MappingError::MissingField { field: "amount" })?;
				let amount = BigDecimal::from_str(amount).map_err(|_| {
					MappingError::InvalidDecimal { field: "amount", value: amount.to_string() }
				})?;
				Ok(match row.payload.get("direction").and_then(|v| v.as_str()) {
					Some("in") => Movement::inflow(asset, amount),
					_ => Movement::outflow(asset, amount),
				})
			};

			if rows.iter().any(|r| r.payload.get("skip").is_some()) {
				return Ok(None);
			}

			let mut tx = CanonicalTransaction::new(
				&rows[0].venue_transaction_id,
				&session.source_name,
				datetime,
				TransactionStatus::Closed,
				if rows.len() == 2 {
					Operation::trade(OperationType::Swap)
				} else {
					Operation::transfer(OperationType::Deposit)
				},
			);
			for row in rows {
				tx.movements.push(movement_of(row)?);
			}
			Ok(Some(tx))
		}
	}

	async fn setup() -> (Processor, RawStore, CanonicalStore, i64, SessionMetadata) {
		let db = Database::open_in_memory().unwrap();
		let accounts = AccountRegistry::new(db.clone());
		let account = accounts
			.find_or_create(&AccountSpec::new(AccountType::ExchangeApi, "testex", "key-1"))
			.await
			.unwrap();
		let session = SessionRegistry::new(db.clone()).create(account.id).await.unwrap();
		let raw = RawStore::new(db.clone());
		let canonical = CanonicalStore::new(db.clone());
		let mut registry = MapperRegistry::new();
		registry.register("testex", "rest", Arc::new(TestMapper));
		let processor = Processor::new(
			Arc::new(registry),
			raw.clone(),
			canonical.clone(),
			CurrencyRegistry::new(db),
		);
		let meta = SessionMetadata {
			session_id: session.id,
			account_id: account.id,
			source_name: "testex".to_string(),
			identifier: "key-1".to_string(),
			user_id: None,
		};
		(processor, raw, canonical, session.id, meta)
	}

	fn raw_row(id: &str, payload: serde_json::Value) -> NewRawTransaction {
		NewRawTransaction {
			source_name: "testex".to_string(),
			provider_name: "rest".to_string(),
			venue_transaction_id: id.to_string(),
			transaction_type_hint: TransactionKind::Ledger,
			source_address: None,
			payload,
			normalized_preview: None,
		}
	}

	#[tokio::test]
	async fn maps_and_persists_rows() {
		let (processor, raw, canonical, session_id, meta) = setup().await;
		raw.save(
			session_id,
			&[raw_row(
				"dep-1",
				serde_json::json!({ "asset": "BTC", "amount": "0.5", "direction": "in" }),
			)],
		)
		.await
		.unwrap();

		let outcome = processor.process_session(session_id, &meta).await.unwrap();
		assert_eq!(outcome.imported, 1);
		assert_eq!(outcome.failed, 0);
		let tx = canonical.find("testex", "dep-1").await.unwrap().unwrap();
		assert_eq!(tx.movements.len(), 1);
		assert_eq!(tx.net_change("BTC"), BigDecimal::from_str("0.5").unwrap());
	}

	#[tokio::test]
	async fn malformed_row_is_quarantined_while_others_proceed() {
		let (processor, raw, canonical, session_id, meta) = setup().await;
		raw.save(
			session_id,
			&[
				raw_row("bad-1", serde_json::json!({ "asset": "BTC" })),
				raw_row(
					"good-1",
					serde_json::json!({ "asset": "ETH", "amount": "2", "direction": "in" }),
				),
			],
		)
		.await
		.unwrap();

		let outcome = processor.process_session(session_id, &meta).await.unwrap();
		assert_eq!(outcome.imported, 1);
		assert_eq!(outcome.failed, 1);
		assert_eq!(outcome.failures[0].code, "MISSING_FIELD");
		assert!(canonical.find("testex", "good-1").await.unwrap().is_some());
		assert!(canonical.find("testex", "bad-1").await.unwrap().is_none());

		let failed = raw
			.load(RawFilter {
				session_id: Some(session_id),
				status: Some(ProcessingStatus::Failed),
				..Default::default()
			})
			.await
			.unwrap();
		assert_eq!(failed.len(), 1);
		assert_eq!(failed[0].venue_transaction_id, "bad-1");
	}

	#[tokio::test]
	async fn correlated_pair_maps_to_one_swap() {
		let (processor, raw, canonical, session_id, meta) = setup().await;
		raw.save(
			session_id,
			&[
				raw_row(
					"leg-1",
					serde_json::json!({
						"asset": "BTC", "amount": "0.1", "direction": "in", "pair": "conv-7"
					}),
				),
				raw_row(
					"leg-2",
					serde_json::json!({
						"asset": "USDT", "amount": "4200", "direction": "out", "pair": "conv-7"
					}),
				),
			],
		)
		.await
		.unwrap();

		let outcome = processor.process_session(session_id, &meta).await.unwrap();
		assert_eq!(outcome.imported, 1);
		let tx = canonical.find("testex", "leg-1").await.unwrap().unwrap();
		assert_eq!(tx.operation.kind, OperationType::Swap);
		assert_eq!(tx.movements.len(), 2);
	}

	#[tokio::test]
	async fn intentional_skip_marks_rows_processed() {
		let (processor, raw, _, session_id, meta) = setup().await;
		raw.save(session_id, &[raw_row("int-1", serde_json::json!({ "skip": true }))])
			.await
			.unwrap();

		let outcome = processor.process_session(session_id, &meta).await.unwrap();
		assert_eq!(outcome.imported, 0);
		assert_eq!(outcome.skipped, 1);
		let rows = raw.load(RawFilter::for_session(session_id)).await.unwrap();
		assert_eq!(rows[0].processing_status, ProcessingStatus::Processed);
	}

	#[tokio::test]
	async fn unknown_provider_rows_are_failed_with_no_mapper() {
		let (processor, raw, _, session_id, meta) = setup().await;
		let mut row = raw_row("x-1", serde_json::json!({}));
		row.provider_name = "mystery".to_string();
		raw.save(session_id, &[row]).await.unwrap();

		let outcome = processor.process_session(session_id, &meta).await.unwrap();
		assert_eq!(outcome.failed, 1);
		assert_eq!(outcome.failures[0].code, "NO_MAPPER");
	}

	#[tokio::test]
	async fn invariant_violation_is_quarantined() {
		let (processor, raw, canonical, session_id, meta) = setup().await;
		// Amount 0 maps fine but fails canonical validation.
		raw.save(
			session_id,
			&[raw_row(
				"zero-1",
				serde_json::json!({ "asset": "BTC", "amount": "0", "direction": "in" }),
			)],
		)
		.await
		.unwrap();

		let outcome = processor.process_session(session_id, &meta).await.unwrap();
		assert_eq!(outcome.failed, 1);
		assert_eq!(outcome.failures[0].code, "NON_POSITIVE_MOVEMENT");
		assert!(canonical.find("testex", "zero-1").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn reprocessing_is_idempotent() {
		let (processor, raw, canonical, session_id, meta) = setup().await;
		raw.save(
			session_id,
			&[raw_row(
				"dep-1",
				serde_json::json!({ "asset": "BTC", "amount": "0.5", "direction": "in" }),
			)],
		)
		.await
		.unwrap();

		processor.process_session(session_id, &meta).await.unwrap();
		// Second pass: nothing pending, nothing double-written.
		let outcome = processor.process_session(session_id, &meta).await.unwrap();
		assert_eq!(outcome, ProcessOutcome::default());
		assert_eq!(canonical.count().await.unwrap(), 1);
	}
}
