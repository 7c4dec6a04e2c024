//! Turns an account into an ordered stream of raw-row batches.
//!
//! One logical fetch stream per supported transaction kind (EVM chains:
//! normal / internal / token / beacon withdrawals; exchanges: the ledger;
//! CSV files: the file). Streams resume from stored cursors behind a replay
//! window, deduplicate within the run, and degrade per-stream: an
//! unrecoverable stream failure yields a sentinel cursor and a warning, not
//! an aborted import.

use std::{collections::HashSet, path::Path, pin::Pin, sync::Arc};

use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::{
	errors::IngestError,
	provider::{ProviderManager, ProviderOperation},
	types::{Account, AccountType, Cursor, NewRawTransaction, TransactionKind},
};

/// Stream key under which a cursor is stored in `accounts.last_cursor`.
pub fn stream_key(account_type: AccountType, kind: TransactionKind) -> String {
	match account_type {
		AccountType::Blockchain => format!("transactions:{}", kind.as_str()),
		AccountType::ExchangeApi => "ledger".to_string(),
		AccountType::ExchangeCsv => "csv".to_string(),
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportWarning {
	pub stream_key: String,
	pub code: String,
	pub message: String,
}

/// One batch out of the importer: rows to persist, cursor positions to
/// advance, and any per-stream warnings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
	pub raw_rows: Vec<NewRawTransaction>,
	pub cursor_updates: Vec<(String, Cursor)>,
	pub warnings: Vec<ImportWarning>,
}

pub type BatchStream = Pin<Box<dyn Stream<Item = Result<RawBatch, IngestError>> + Send>>;

pub struct Importer {
	pm: Arc<ProviderManager>,
}

impl Importer {
	pub fn new(pm: Arc<ProviderManager>) -> Self {
		Self { pm }
	}

	/// Pre-import validation: input shape and at least one healthy provider.
	/// Input problems are reported as typed errors before any stream runs.
	pub async fn can_import(&self, account: &Account) -> Result<(), IngestError> {
		match account.account_type {
			AccountType::Blockchain => validate_address(&account.identifier)?,
			AccountType::ExchangeCsv => {
				let path = Path::new(&account.identifier);
				if !path.is_file() {
					return Err(IngestError::invalid_input(
						"csv_path",
						format!("{} is not a readable file", account.identifier),
					));
				}
			},
			AccountType::ExchangeApi => {
				let Some(credentials) = account.credentials.as_ref().and_then(|c| c.as_object())
				else {
					return Err(IngestError::Credentials {
						source_name: account.source_name.clone(),
						message: "missing credentials blob".to_string(),
					});
				};
				if credentials.is_empty()
					|| credentials.values().any(|v| v.as_str().is_some_and(str::is_empty))
				{
					return Err(IngestError::Credentials {
						source_name: account.source_name.clone(),
						message: "credentials blob has empty fields".to_string(),
					});
				}
			},
		}

		if !self.pm.has_healthy_provider(&account.source_name).await {
			return Err(IngestError::Provider(crate::provider::ProviderError::NoProviders {
				source_name: account.source_name.clone(),
				operation: "import",
			}));
		}
		Ok(())
	}

	/// The logical streams this account imports, in canonical order.
	fn streams_for(&self, account: &Account) -> Vec<(String, ProviderOperation)> {
		match account.account_type {
			AccountType::Blockchain => self
				.pm
				.supported_transaction_kinds(&account.source_name)
				.into_iter()
				.filter(|kind| {
					!matches!(kind, TransactionKind::Ledger | TransactionKind::CsvRow)
				})
				.map(|kind| {
					(
						stream_key(account.account_type, kind),
						ProviderOperation::GetAddressTransactions {
							address: account.identifier.clone(),
							transaction_type: kind,
							cursor: None,
						},
					)
				})
				.collect(),
			AccountType::ExchangeApi => vec![(
				stream_key(account.account_type, TransactionKind::Ledger),
				ProviderOperation::GetLedgerEntries { asset: None, cursor: None },
			)],
			AccountType::ExchangeCsv => vec![(
				stream_key(account.account_type, TransactionKind::CsvRow),
				ProviderOperation::ReadCsvRows {
					path: account.identifier.clone().into(),
					cursor: None,
				},
			)],
		}
	}

	/// Run the import. Rows are emitted in provider order within each
	/// stream; no ordering is promised across streams.
	pub fn import(&self, account: Account) -> BatchStream {
		let pm = self.pm.clone();
		let streams = self.streams_for(&account);
		// A run where some stored cursor carries a failed-fetch sentinel is
		// a retry: healthy, complete streams are skipped so only the failed
		// ones are re-fetched.
		let retry_mode = account.has_failed_streams();

		Box::pin(async_stream::stream! {
			let mut seen: HashSet<(String, TransactionKind, Option<String>)> = HashSet::new();

			for (key, op) in streams {
				let stored = account.cursor_for(&key);
				if retry_mode {
					if let Some(cursor) = stored {
						if !cursor.is_failed() && cursor.metadata.is_complete {
							tracing::debug!(stream = %key, "retry run: skipping healthy stream");
							continue;
						}
					}
				}

				let start_cursor = stored.map(|cursor| {
					let base = if cursor.is_failed() {
						// Strip the sentinel; its primary is the last good
						// position before the failure.
						Cursor::new(cursor.primary.clone(), None)
					} else {
						cursor.clone()
					};
					pm.apply_replay_window(&account.source_name, &base)
				});

				tracing::info!(
					stream = %key,
					source = %account.source_name,
					resumed = start_cursor.is_some(),
					"starting fetch stream"
				);

				let mut chunks = pm.execute_streaming(
					&account.source_name,
					op.with_cursor(start_cursor),
					account.provider_name.as_deref(),
				);
				let mut last_good: Option<Cursor> = None;

				while let Some(chunk) = chunks.next().await {
					match chunk {
						Ok(chunk) => {
							let mut raw_rows = Vec::with_capacity(chunk.rows.len());
							for row in chunk.rows {
								let raw = NewRawTransaction {
									source_name: account.source_name.clone(),
									provider_name: chunk.provider_name.clone(),
									venue_transaction_id: row.venue_transaction_id,
									transaction_type_hint: row.kind,
									source_address: row.source_address,
									payload: row.payload,
									normalized_preview: row.normalized_preview,
								};
								if seen.insert(raw.identity()) {
									raw_rows.push(raw);
								}
							}
							last_good = Some(chunk.cursor.clone());
							yield Ok(RawBatch {
								raw_rows,
								cursor_updates: vec![(key.clone(), chunk.cursor)],
								warnings: Vec::new(),
							});
						},
						Err(error) if error.is_credentials() => {
							yield Err(IngestError::Credentials {
								source_name: account.source_name.clone(),
								message: error.to_string(),
							});
							return;
						},
						Err(error) => {
							// Per-stream degradation: record a sentinel so
							// the next run retries just this stream.
							let previous = last_good.as_ref().or(stored);
							let sentinel = Cursor::failed_sentinel(
								previous,
								None,
								&error.to_string(),
							);
							tracing::warn!(
								stream = %key,
								code = error.code(),
								%error,
								"stream failed, recording sentinel cursor"
							);
							yield Ok(RawBatch {
								raw_rows: Vec::new(),
								cursor_updates: vec![(key.clone(), sentinel)],
								warnings: vec![ImportWarning {
									stream_key: key.clone(),
									code: error.code().to_string(),
									message: error.to_string(),
								}],
							});
							break;
						},
					}
				}
			}
		})
	}
}

fn validate_address(identifier: &str) -> Result<(), IngestError> {
	if identifier.is_empty() || identifier.chars().any(char::is_whitespace) {
		return Err(IngestError::invalid_input("address", "address must be non-empty"));
	}
	if let Some(hex) = identifier.strip_prefix("0x") {
		if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
			return Err(IngestError::invalid_input(
				"address",
				format!("{identifier} is not a valid EVM address"),
			));
		}
	} else if identifier.len() < 8 {
		return Err(IngestError::invalid_input(
			"address",
			format!("{identifier} is too short to be an address"),
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::collections::{BTreeMap, HashSet as StdHashSet};

	use async_trait::async_trait;
	use chrono::Utc;

	use crate::{
		gate::{BreakerConfig, RateHealthGate},
		provider::{
			ChunkStats, ChunkStream, OperationKind, ProviderAdapter, ProviderCapabilities,
			ProviderError, ProviderManagerConfig, ProviderRegistration, RawChunk, RawRow,
		},
		types::CursorPosition,
	};

	use super::*;

	/// Serves fixed rows for a subset of transaction kinds; kinds listed in
	/// `failing` error out after zero chunks.
	struct ScriptedAdapter {
		name: String,
		source: String,
		capabilities: ProviderCapabilities,
		rows_by_kind: BTreeMap<&'static str, Vec<&'static str>>,
		failing: StdHashSet<TransactionKind>,
	}

	impl ScriptedAdapter {
		fn new(
			name: &str,
			source: &str,
			kinds: &[TransactionKind],
			rows_by_kind: BTreeMap<&'static str, Vec<&'static str>>,
			failing: &[TransactionKind],
		) -> Self {
			Self {
				name: name.to_string(),
				source: source.to_string(),
				capabilities: ProviderCapabilities::new(
					[OperationKind::GetAddressTransactions],
					kinds.iter().copied(),
				),
				rows_by_kind,
				failing: failing.iter().copied().collect(),
			}
		}
	}

	#[async_trait]
	impl ProviderAdapter for ScriptedAdapter {
		fn name(&self) -> &str {
			&self.name
		}

		fn source(&self) -> &str {
			&self.source
		}

		fn capabilities(&self) -> &ProviderCapabilities {
			&self.capabilities
		}

		async fn execute(
			&self,
			_op: &ProviderOperation,
		) -> Result<serde_json::Value, ProviderError> {
			Ok(serde_json::Value::Null)
		}

		fn execute_streaming(&self, op: &ProviderOperation) -> ChunkStream {
			let name = self.name.clone();
			let kind = op.transaction_kind().unwrap();
			let fails = self.failing.contains(&kind);
			let ids: Vec<String> = self
				.rows_by_kind
				.get(kind.as_str())
				.map(|ids| ids.iter().map(|s| s.to_string()).collect())
				.unwrap_or_default();
			Box::pin(async_stream::stream! {
				if fails {
					yield Err(ProviderError::Transport {
						provider: name.clone(),
						operation: "get_address_transactions",
						message: "429 too many requests".to_string(),
					});
					return;
				}
				let total = ids.len();
				for (i, id) in ids.into_iter().enumerate() {
					let mut cursor =
						Cursor::new(CursorPosition::BlockNumber(100 + i as u64), Some(&name));
					cursor.metadata.is_complete = i + 1 == total;
					cursor.metadata.updated_at = Utc::now();
					yield Ok(RawChunk {
						rows: vec![RawRow {
							venue_transaction_id: id.clone(),
							kind,
							source_address: Some("0xme".to_string()),
							payload: serde_json::json!({ "hash": id }),
							normalized_preview: None,
						}],
						provider_name: name.clone(),
						cursor,
						is_complete: i + 1 == total,
						stats: ChunkStats { fetched: 1, latency_ms: 1 },
					});
				}
				if total == 0 {
					let mut cursor = Cursor::new(CursorPosition::BlockNumber(100), Some(&name));
					cursor.metadata.is_complete = true;
					yield Ok(RawChunk {
						rows: Vec::new(),
						provider_name: name.clone(),
						cursor,
						is_complete: true,
						stats: ChunkStats::default(),
					});
				}
			})
		}

		async fn is_healthy(&self) -> Result<bool, ProviderError> {
			Ok(true)
		}

		fn extract_cursors(&self, _row: &RawRow) -> Vec<Cursor> {
			Vec::new()
		}

		fn apply_replay_window(&self, cursor: &Cursor) -> Cursor {
			let mut replayed = cursor.clone();
			if let CursorPosition::BlockNumber(n) = replayed.primary {
				replayed.primary = CursorPosition::BlockNumber(n.saturating_sub(12));
			}
			replayed
		}
	}

	fn account(kind: AccountType, source: &str, identifier: &str) -> Account {
		Account {
			id: 1,
			user_id: None,
			account_type: kind,
			source_name: source.to_string(),
			identifier: identifier.to_string(),
			parent_account_id: None,
			provider_name: None,
			credentials: None,
			last_cursor: BTreeMap::new(),
			verification: None,
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	fn importer_with(adapter: ScriptedAdapter) -> Importer {
		let pm = Arc::new(ProviderManager::new(
			Arc::new(RateHealthGate::new(BreakerConfig::default())),
			ProviderManagerConfig::default(),
		));
		pm.register(Arc::new(adapter), ProviderRegistration::enabled_with_priority(0));
		Importer::new(pm)
	}

	async fn collect(importer: &Importer, account: Account) -> Vec<RawBatch> {
		importer
			.import(account)
			.collect::<Vec<_>>()
			.await
			.into_iter()
			.collect::<Result<Vec<_>, _>>()
			.unwrap()
	}

	#[tokio::test]
	async fn imports_every_supported_stream() {
		let importer = importer_with(ScriptedAdapter::new(
			"etherscan",
			"ethereum",
			&[TransactionKind::Normal, TransactionKind::Token],
			BTreeMap::from([("normal", vec!["0x1", "0x2"]), ("token", vec!["0xt1"])]),
			&[],
		));
		let batches = collect(
			&importer,
			account(AccountType::Blockchain, "ethereum", "0x1111111111111111111111111111111111111111"),
		)
		.await;

		let rows: Vec<_> = batches.iter().flat_map(|b| &b.raw_rows).collect();
		assert_eq!(rows.len(), 3);
		assert!(batches.iter().all(|b| b.warnings.is_empty()));
		// Every batch advances exactly one stream cursor.
		assert!(batches.iter().all(|b| b.cursor_updates.len() == 1));
		let keys: StdHashSet<_> =
			batches.iter().map(|b| b.cursor_updates[0].0.clone()).collect();
		assert_eq!(
			keys,
			StdHashSet::from(["transactions:normal".to_string(), "transactions:token".to_string()])
		);
	}

	#[tokio::test]
	async fn duplicate_rows_within_a_run_are_dropped() {
		let importer = importer_with(ScriptedAdapter::new(
			"etherscan",
			"ethereum",
			&[TransactionKind::Normal],
			BTreeMap::from([("normal", vec!["0x1", "0x1", "0x2"])]),
			&[],
		));
		let batches = collect(
			&importer,
			account(AccountType::Blockchain, "ethereum", "0x1111111111111111111111111111111111111111"),
		)
		.await;
		let ids: Vec<_> = batches
			.iter()
			.flat_map(|b| &b.raw_rows)
			.map(|r| r.venue_transaction_id.clone())
			.collect();
		assert_eq!(ids, vec!["0x1", "0x2"]);
	}

	#[tokio::test]
	async fn failed_stream_yields_sentinel_and_continues() {
		let importer = importer_with(ScriptedAdapter::new(
			"etherscan",
			"ethereum",
			&[TransactionKind::Normal, TransactionKind::Token],
			BTreeMap::from([("normal", vec!["0x1"])]),
			&[TransactionKind::Token],
		));
		let batches = collect(
			&importer,
			account(AccountType::Blockchain, "ethereum", "0x1111111111111111111111111111111111111111"),
		)
		.await;

		// Normal stream delivered rows; token stream degraded to a sentinel.
		assert_eq!(batches.iter().flat_map(|b| &b.raw_rows).count(), 1);
		let warning_batch = batches.iter().find(|b| !b.warnings.is_empty()).unwrap();
		assert_eq!(warning_batch.warnings[0].stream_key, "transactions:token");
		assert_eq!(warning_batch.warnings[0].code, "ALL_PROVIDERS_FAILED");
		let (_, sentinel) = &warning_batch.cursor_updates[0];
		assert!(sentinel.is_failed());
	}

	#[tokio::test]
	async fn retry_run_skips_healthy_complete_streams() {
		let importer = importer_with(ScriptedAdapter::new(
			"etherscan",
			"ethereum",
			&[TransactionKind::Normal, TransactionKind::Token],
			BTreeMap::from([("normal", vec!["0x1"]), ("token", vec!["0xt1"])]),
			&[],
		));
		let mut acct = account(
			AccountType::Blockchain,
			"ethereum",
			"0x1111111111111111111111111111111111111111",
		);
		let mut healthy = Cursor::new(CursorPosition::BlockNumber(100), Some("etherscan"));
		healthy.metadata.is_complete = true;
		acct.last_cursor.insert("transactions:normal".to_string(), healthy.clone());
		acct.last_cursor.insert(
			"transactions:token".to_string(),
			Cursor::failed_sentinel(Some(&healthy), None, "429 from all providers"),
		);

		let batches = collect(&importer, acct).await;
		// Only the failed token stream is re-fetched.
		assert!(batches
			.iter()
			.all(|b| b.cursor_updates[0].0 == "transactions:token"));
		assert_eq!(batches.iter().flat_map(|b| &b.raw_rows).count(), 1);
	}

	#[tokio::test]
	async fn can_import_rejects_malformed_evm_address() {
		let importer = importer_with(ScriptedAdapter::new(
			"etherscan",
			"ethereum",
			&[TransactionKind::Normal],
			BTreeMap::new(),
			&[],
		));
		let err = importer
			.can_import(&account(AccountType::Blockchain, "ethereum", "0x1234"))
			.await
			.unwrap_err();
		assert_eq!(err.code(), "INVALID_INPUT");
	}

	#[tokio::test]
	async fn can_import_requires_a_healthy_provider() {
		let pm = Arc::new(ProviderManager::new(
			Arc::new(RateHealthGate::new(BreakerConfig::default())),
			ProviderManagerConfig::default(),
		));
		let importer = Importer::new(pm);
		let err = importer
			.can_import(&account(
				AccountType::Blockchain,
				"ethereum",
				"0x1111111111111111111111111111111111111111",
			))
			.await
			.unwrap_err();
		assert_eq!(err.code(), "NO_PROVIDERS");
	}

	#[tokio::test]
	async fn can_import_checks_credential_shape_only() {
		let importer = importer_with(ScriptedAdapter::new(
			"kraken",
			"kraken",
			&[TransactionKind::Ledger],
			BTreeMap::new(),
			&[],
		));
		let mut acct = account(AccountType::ExchangeApi, "kraken", "main");
		let err = importer.can_import(&acct).await.unwrap_err();
		assert_eq!(err.code(), "CREDENTIALS_REJECTED");

		acct.credentials =
			Some(serde_json::json!({ "api_key": "k", "api_secret": "s" }));
		assert!(importer.can_import(&acct).await.is_ok());
	}
}
