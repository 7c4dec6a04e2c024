//! Top-level ingestion driver: account → session → import → process →
//! finalize, with the failure semantics that make partial progress safe.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;

use crate::{
	errors::IngestError,
	importer::{Importer, ImportWarning},
	processor::{MapperRegistry, ProcessOutcome, Processor, RowFailure, SessionMetadata},
	provider::ProviderManager,
	store::{
		AccountRegistry, CanonicalStore, CurrencyRegistry, Database, RawStore, SessionRegistry,
		StoreError,
	},
	types::{Account, AccountSpec, ImportSession, SessionOutcome},
};

/// Final record of one run. Sessions that fail validation or credentials are
/// reported here with `status = failed`, not as an `Err`: the session row is
/// the authoritative outcome. `Err` is reserved for failures that prevented
/// running at all (duplicate session, storage loss).
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionReport {
	pub session: ImportSession,
	pub warnings: Vec<ImportWarning>,
	pub row_failures: Vec<RowFailure>,
}

pub struct IngestionOrchestrator {
	accounts: AccountRegistry,
	sessions: SessionRegistry,
	raw: RawStore,
	importer: Importer,
	processor: Processor,
}

impl IngestionOrchestrator {
	pub fn new(db: Database, pm: Arc<ProviderManager>, mappers: Arc<MapperRegistry>) -> Self {
		let raw = RawStore::new(db.clone());
		let canonical = CanonicalStore::new(db.clone());
		let currencies = CurrencyRegistry::new(db.clone());
		Self {
			accounts: AccountRegistry::new(db.clone()),
			sessions: SessionRegistry::new(db),
			raw: raw.clone(),
			importer: Importer::new(pm),
			processor: Processor::new(mappers, raw, canonical, currencies),
		}
	}

	pub fn accounts(&self) -> &AccountRegistry {
		&self.accounts
	}

	pub fn sessions(&self) -> &SessionRegistry {
		&self.sessions
	}

	/// Run one import for the account described by `spec`. Cancellation is
	/// observed between chunks; the running chunk always completes or fails,
	/// never half-writes.
	pub async fn run(
		&self,
		spec: &AccountSpec,
		cancel: watch::Receiver<bool>,
	) -> Result<IngestionReport, IngestError> {
		let account = self.accounts.find_or_create(spec).await?;
		let _session_lock = self.accounts.lock_session(account.id)?;
		let session = self.sessions.create(account.id).await?;
		tracing::info!(
			session_id = session.id,
			account_id = account.id,
			source = %account.source_name,
			"ingestion run started"
		);

		// Pre-import validation failures are recorded on the session.
		if let Err(error) = self.importer.can_import(&account).await {
			return self.finalize_failed(session.id, error).await;
		}

		let meta = SessionMetadata {
			session_id: session.id,
			account_id: account.id,
			source_name: account.source_name.clone(),
			identifier: account.identifier.clone(),
			user_id: account.user_id.clone(),
		};

		let (duplicates, warnings, cancelled, fatal) =
			self.drive_import(&account, session.id, cancel).await;
		if let Some(error) = fatal {
			return self.finalize_failed(session.id, error).await;
		}
		if cancelled {
			let finalized = self
				.sessions
				.finalize(session.id, SessionOutcome::cancelled(0, duplicates as i64))
				.await?;
			tracing::warn!(session_id = finalized.id, "ingestion run cancelled");
			return Ok(IngestionReport {
				session: finalized,
				warnings,
				row_failures: Vec::new(),
			});
		}

		let outcome = match self.processor.process_session(session.id, &meta).await {
			Ok(outcome) => outcome,
			Err(error) => return self.finalize_failed(session.id, error.into()).await,
		};

		let finalized = self
			.sessions
			.finalize(
				session.id,
				SessionOutcome {
					status: crate::types::SessionStatus::Completed,
					imported: outcome.imported as i64,
					skipped: (outcome.skipped + duplicates) as i64,
					error_message: None,
					error_details: error_summary(&warnings, &outcome),
				},
			)
			.await?;
		Ok(IngestionReport {
			session: finalized,
			warnings,
			row_failures: outcome.failures,
		})
	}

	/// Stream batches into the raw store, advancing cursors per chunk.
	/// Returns (duplicate rows, warnings, cancelled, fatal error).
	async fn drive_import(
		&self,
		account: &Account,
		session_id: i64,
		cancel: watch::Receiver<bool>,
	) -> (u64, Vec<ImportWarning>, bool, Option<IngestError>) {
		let mut duplicates = 0u64;
		let mut warnings = Vec::new();
		let mut stream = self.importer.import(account.clone());

		loop {
			if *cancel.borrow() {
				return (duplicates, warnings, true, None);
			}
			let Some(next) = stream.next().await else { break };
			match next {
				Ok(batch) => {
					match self.raw.save(session_id, &batch.raw_rows).await {
						Ok(outcome) => duplicates += outcome.duplicates,
						Err(error) => return (duplicates, warnings, false, Some(error.into())),
					}
					for (key, cursor) in batch.cursor_updates {
						match self.accounts.update_cursor(account.id, &key, cursor).await {
							Ok(()) => {},
							// Replay-window overlap re-fetches ground the
							// cursor already covers; keep the stored one.
							Err(StoreError::CursorRegression { stream_key, .. }) => {
								tracing::trace!(stream = %stream_key, "cursor behind stored position, not persisted");
							},
							Err(error) => {
								return (duplicates, warnings, false, Some(error.into()))
							},
						}
					}
					warnings.extend(batch.warnings);
				},
				Err(error) => return (duplicates, warnings, false, Some(error)),
			}
		}
		(duplicates, warnings, false, None)
	}

	async fn finalize_failed(
		&self,
		session_id: i64,
		error: IngestError,
	) -> Result<IngestionReport, IngestError> {
		tracing::error!(session_id, code = error.code(), %error, "ingestion run failed");
		let details = serde_json::json!({ "code": error.code() });
		let finalized = self
			.sessions
			.finalize(session_id, SessionOutcome::failed(&error.to_string(), Some(details)))
			.await?;
		Ok(IngestionReport {
			session: finalized,
			warnings: Vec::new(),
			row_failures: Vec::new(),
		})
	}
}

/// Structured error summary stored on completed sessions that had
/// non-fatal trouble: degraded streams or quarantined rows.
fn error_summary(
	warnings: &[ImportWarning],
	outcome: &ProcessOutcome,
) -> Option<serde_json::Value> {
	if warnings.is_empty() && outcome.failures.is_empty() {
		return None;
	}
	let mut summary = serde_json::Map::new();
	if !warnings.is_empty() {
		summary.insert(
			"warnings".to_string(),
			serde_json::to_value(warnings).unwrap_or_default(),
		);
	}
	if !outcome.failures.is_empty() {
		summary.insert(
			"row_failures".to_string(),
			serde_json::to_value(&outcome.failures).unwrap_or_default(),
		);
	}
	Some(serde_json::Value::Object(summary))
}

#[cfg(test)]
mod tests {
	use crate::{
		gate::{BreakerConfig, RateHealthGate},
		provider::{ProviderManagerConfig, ProviderRegistration},
		types::{AccountType, SessionStatus},
	};

	use super::*;

	fn orchestrator_without_providers() -> IngestionOrchestrator {
		let db = Database::open_in_memory().unwrap();
		let pm = Arc::new(ProviderManager::new(
			Arc::new(RateHealthGate::new(BreakerConfig::default())),
			ProviderManagerConfig::default(),
		));
		IngestionOrchestrator::new(db, pm, Arc::new(MapperRegistry::new()))
	}

	#[tokio::test]
	async fn validation_failure_is_recorded_on_the_session() {
		let orchestrator = orchestrator_without_providers();
		let (_tx, cancel) = watch::channel(false);
		let report = orchestrator
			.run(
				&AccountSpec::new(
					AccountType::Blockchain,
					"ethereum",
					"0x1111111111111111111111111111111111111111",
				),
				cancel,
			)
			.await
			.unwrap();
		assert_eq!(report.session.status, SessionStatus::Failed);
		assert_eq!(
			report.session.error_details.as_ref().unwrap()["code"],
			serde_json::json!("NO_PROVIDERS")
		);
	}

	#[tokio::test]
	async fn missing_credentials_fail_the_session() {
		let orchestrator = orchestrator_without_providers();
		let (_tx, cancel) = watch::channel(false);
		let report = orchestrator
			.run(&AccountSpec::new(AccountType::ExchangeApi, "kraken", "main"), cancel)
			.await
			.unwrap();
		assert_eq!(report.session.status, SessionStatus::Failed);
		assert_eq!(
			report.session.error_details.as_ref().unwrap()["code"],
			serde_json::json!("CREDENTIALS_REJECTED")
		);
	}

	#[tokio::test]
	async fn pre_set_cancellation_finalizes_cancelled() {
		// A CSV account whose file exists but whose run is cancelled before
		// the first chunk.
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("empty.csv");
		std::fs::write(&path, "UTC_Time,Account,Operation,Coin,Change,Remark\n").unwrap();

		let db = Database::open_in_memory().unwrap();
		let pm = Arc::new(ProviderManager::new(
			Arc::new(RateHealthGate::new(BreakerConfig::default())),
			ProviderManagerConfig::default(),
		));
		pm.register(
			Arc::new(crate::adapters::exchange_csv::CsvLedgerAdapter::binance()),
			ProviderRegistration::enabled_with_priority(0),
		);
		let orchestrator =
			IngestionOrchestrator::new(db, pm, Arc::new(MapperRegistry::new()));

		let (tx, cancel) = watch::channel(true);
		let report = orchestrator
			.run(
				&AccountSpec::new(
					AccountType::ExchangeCsv,
					"binance",
					path.to_str().unwrap(),
				),
				cancel,
			)
			.await
			.unwrap();
		drop(tx);
		assert_eq!(report.session.status, SessionStatus::Cancelled);
	}

	#[tokio::test]
	async fn second_concurrent_session_is_rejected_immediately() {
		let orchestrator = orchestrator_without_providers();
		let account = orchestrator
			.accounts()
			.find_or_create(&AccountSpec::new(
				AccountType::Blockchain,
				"ethereum",
				"0x1111111111111111111111111111111111111111",
			))
			.await
			.unwrap();
		let _held = orchestrator.accounts().lock_session(account.id).unwrap();

		let (_tx, cancel) = watch::channel(false);
		let err = orchestrator
			.run(
				&AccountSpec::new(
					AccountType::Blockchain,
					"ethereum",
					"0x1111111111111111111111111111111111111111",
				),
				cancel,
			)
			.await
			.unwrap_err();
		assert_eq!(err.code(), "SESSION_ALREADY_ACTIVE");
	}
}
