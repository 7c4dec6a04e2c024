//! Exchange CSV exports as a provider.
//!
//! The adapter drives local export files through the same provider contract
//! as network venues. Two Binance export schemas are recognized by header:
//! the spot trade history ("Date(UTC),Market,Type,...") and the account
//! statement ("UTC_Time,Account,Operation,...").

mod mapper;

pub use mapper::BinanceCsvMapper;

use std::{path::PathBuf, time::Instant};

use async_trait::async_trait;

use crate::{
	adapters::payload_digest,
	provider::{
		ChunkStats, ChunkStream, OperationKind, ProviderAdapter, ProviderCapabilities,
		ProviderError, ProviderOperation, RateLimitSpec, RawChunk, RawRow,
	},
	types::{Cursor, CursorPosition, TransactionKind},
};

const CHUNK_ROWS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsvSchema {
	TradeHistory,
	AccountStatement,
}

impl CsvSchema {
	fn as_str(&self) -> &'static str {
		match self {
			CsvSchema::TradeHistory => "trade",
			CsvSchema::AccountStatement => "statement",
		}
	}

	fn detect(headers: &[String]) -> Option<Self> {
		let has = |name: &str| headers.iter().any(|h| h == name);
		if has("Market") && has("Type") {
			Some(CsvSchema::TradeHistory)
		} else if has("Operation") && has("Change") {
			Some(CsvSchema::AccountStatement)
		} else {
			None
		}
	}
}

#[derive(Clone)]
pub struct CsvLedgerAdapter {
	name: String,
	source: String,
	capabilities: ProviderCapabilities,
}

impl CsvLedgerAdapter {
	pub fn binance() -> Self {
		Self {
			name: "binance-csv".to_string(),
			source: "binance".to_string(),
			capabilities: ProviderCapabilities::new(
				[OperationKind::ReadCsvRows],
				[TransactionKind::CsvRow],
			),
		}
	}

	fn parse_rows(&self, content: &str) -> Result<Vec<RawRow>, ProviderError> {
		let mut reader = csv::ReaderBuilder::new()
			.has_headers(true)
			.trim(csv::Trim::All)
			.from_reader(content.as_bytes());
		let headers: Vec<String> = reader
			.headers()
			.map_err(|e| self.malformed(format!("unreadable header row: {e}")))?
			.iter()
			.map(str::to_string)
			.collect();
		let schema = CsvSchema::detect(&headers)
			.ok_or_else(|| self.malformed(format!("unrecognized CSV schema: {headers:?}")))?;

		let mut rows = Vec::new();
		for (line, record) in reader.records().enumerate() {
			let record =
				record.map_err(|e| self.malformed(format!("bad record at line {line}: {e}")))?;
			let mut payload = serde_json::Map::new();
			payload.insert(
				"schema".to_string(),
				serde_json::Value::String(schema.as_str().to_string()),
			);
			for (header, value) in headers.iter().zip(record.iter()) {
				payload
					.insert(header.clone(), serde_json::Value::String(value.to_string()));
			}
			let payload = serde_json::Value::Object(payload);
			rows.push(RawRow {
				venue_transaction_id: format!(
					"{}:{line}:{}",
					schema.as_str(),
					payload_digest(&payload)
				),
				kind: TransactionKind::CsvRow,
				source_address: None,
				payload,
				normalized_preview: None,
			});
		}
		Ok(rows)
	}

	fn malformed(&self, message: String) -> ProviderError {
		ProviderError::Malformed { provider: self.name.clone(), message }
	}

	async fn read_file(&self, path: &PathBuf) -> Result<String, ProviderError> {
		tokio::fs::read_to_string(path).await.map_err(|e| ProviderError::Transport {
			provider: self.name.clone(),
			operation: "read_csv_rows",
			message: format!("cannot read {}: {e}", path.display()),
		})
	}
}

#[async_trait]
impl ProviderAdapter for CsvLedgerAdapter {
	fn name(&self) -> &str {
		&self.name
	}

	fn source(&self) -> &str {
		&self.source
	}

	fn capabilities(&self) -> &ProviderCapabilities {
		&self.capabilities
	}

	fn rate_limit(&self) -> RateLimitSpec {
		// Local files need no pacing to speak of.
		RateLimitSpec { requests_per_sec: 1000.0, burst: 1000 }
	}

	async fn execute(&self, op: &ProviderOperation) -> Result<serde_json::Value, ProviderError> {
		match op {
			ProviderOperation::ReadCsvRows { path, .. } => {
				let content = self.read_file(path).await?;
				let rows = self.parse_rows(&content)?;
				Ok(serde_json::Value::Array(rows.into_iter().map(|r| r.payload).collect()))
			},
			other => Err(ProviderError::Unsupported {
				provider: self.name.clone(),
				operation: other.name(),
			}),
		}
	}

	fn execute_streaming(&self, op: &ProviderOperation) -> ChunkStream {
		let ProviderOperation::ReadCsvRows { path, cursor } = op else {
			let error = ProviderError::Unsupported {
				provider: self.name.clone(),
				operation: op.name(),
			};
			return Box::pin(futures::stream::once(async move { Err(error) }));
		};
		let adapter = self.clone();
		let path = path.clone();
		let skip = match cursor {
			Some(Cursor { primary: CursorPosition::Sequence(n), .. }) => *n as usize,
			_ => 0,
		};

		Box::pin(async_stream::stream! {
			let started = Instant::now();
			let rows = match adapter.read_file(&path).await {
				Ok(content) => match adapter.parse_rows(&content) {
					Ok(rows) => rows,
					Err(error) => {
						yield Err(error);
						return;
					},
				},
				Err(error) => {
					yield Err(error);
					return;
				},
			};
			let latency_ms = started.elapsed().as_millis() as u64;

			let remaining: Vec<RawRow> = rows.into_iter().skip(skip).collect();
			let total = remaining.len();
			let mut emitted = skip as u64;
			let mut offset = 0usize;
			loop {
				let slice: Vec<RawRow> =
					remaining[offset..(offset + CHUNK_ROWS).min(total)].to_vec();
				offset += slice.len();
				emitted += slice.len() as u64;
				let is_complete = offset >= total;

				let mut cursor =
					Cursor::new(CursorPosition::Sequence(emitted), Some(&adapter.name));
				cursor.last_transaction_id =
					slice.last().map(|r| r.venue_transaction_id.clone());
				cursor.total_fetched = emitted;
				cursor.metadata.is_complete = is_complete;

				yield Ok(RawChunk {
					stats: ChunkStats { fetched: slice.len() as u32, latency_ms },
					rows: slice,
					provider_name: adapter.name.clone(),
					cursor,
					is_complete,
				});
				if is_complete {
					return;
				}
			}
		})
	}

	async fn is_healthy(&self) -> Result<bool, ProviderError> {
		Ok(true)
	}

	fn extract_cursors(&self, _row: &RawRow) -> Vec<Cursor> {
		// CSV position is line-based; the stream assigns sequence cursors.
		Vec::new()
	}

	fn apply_replay_window(&self, cursor: &Cursor) -> Cursor {
		// A re-imported file is re-read in full; dedup absorbs the overlap.
		let mut replayed = cursor.clone();
		replayed.primary = CursorPosition::Sequence(0);
		replayed
	}
}

#[cfg(test)]
mod tests {
	use futures::StreamExt;

	use super::*;

	const TRADE_CSV: &str = "\
Date(UTC),Market,Type,Price,Amount,Total,Fee,Fee Coin
2024-01-15 10:30:00,BTCUSDT,BUY,42000,0.1,4200,0.42,USDT
2024-01-16 11:00:00,ETHUSDT,SELL,2500,2,5000,5,USDT
";

	const STATEMENT_CSV: &str = "\
UTC_Time,Account,Operation,Coin,Change,Remark
2024-01-15 10:30:00,Spot,Convert Market,BTC,0.1,Convert Market
2024-01-15 10:30:00,Spot,Convert Market,USDT,-4200,Convert Market
";

	async fn stream_rows(adapter: &CsvLedgerAdapter, path: &std::path::Path) -> Vec<RawChunk> {
		adapter
			.execute_streaming(&ProviderOperation::ReadCsvRows {
				path: path.to_path_buf(),
				cursor: None,
			})
			.collect::<Vec<_>>()
			.await
			.into_iter()
			.collect::<Result<_, _>>()
			.unwrap()
	}

	fn write_csv(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("export.csv");
		std::fs::write(&path, content).unwrap();
		(dir, path)
	}

	#[tokio::test]
	async fn streams_trade_history_rows() {
		let (_dir, path) = write_csv(TRADE_CSV);
		let chunks = stream_rows(&CsvLedgerAdapter::binance(), &path).await;
		assert_eq!(chunks.len(), 1);
		assert!(chunks[0].is_complete);
		assert_eq!(chunks[0].rows.len(), 2);
		assert_eq!(chunks[0].rows[0].payload["schema"], "trade");
		assert_eq!(chunks[0].rows[0].payload["Market"], "BTCUSDT");
		assert_eq!(chunks[0].cursor.primary, CursorPosition::Sequence(2));
	}

	#[tokio::test]
	async fn statement_schema_is_detected() {
		let (_dir, path) = write_csv(STATEMENT_CSV);
		let chunks = stream_rows(&CsvLedgerAdapter::binance(), &path).await;
		assert_eq!(chunks[0].rows[0].payload["schema"], "statement");
		assert_eq!(chunks[0].rows[0].payload["Operation"], "Convert Market");
	}

	#[tokio::test]
	async fn empty_file_completes_with_zero_rows() {
		let (_dir, path) = write_csv("UTC_Time,Account,Operation,Coin,Change,Remark\n");
		let chunks = stream_rows(&CsvLedgerAdapter::binance(), &path).await;
		assert_eq!(chunks.len(), 1);
		assert!(chunks[0].is_complete);
		assert!(chunks[0].rows.is_empty());
	}

	#[tokio::test]
	async fn venue_ids_are_stable_across_reads() {
		let (_dir, path) = write_csv(TRADE_CSV);
		let adapter = CsvLedgerAdapter::binance();
		let first = stream_rows(&adapter, &path).await;
		let second = stream_rows(&adapter, &path).await;
		let ids = |chunks: &[RawChunk]| {
			chunks
				.iter()
				.flat_map(|c| &c.rows)
				.map(|r| r.venue_transaction_id.clone())
				.collect::<Vec<_>>()
		};
		assert_eq!(ids(&first), ids(&second));
	}

	#[tokio::test]
	async fn identical_rows_on_different_lines_get_distinct_ids() {
		let csv = "\
Date(UTC),Market,Type,Price,Amount,Total,Fee,Fee Coin
2024-01-15 10:30:00,BTCUSDT,BUY,42000,0.1,4200,0.42,USDT
2024-01-15 10:30:00,BTCUSDT,BUY,42000,0.1,4200,0.42,USDT
";
		let (_dir, path) = write_csv(csv);
		let chunks = stream_rows(&CsvLedgerAdapter::binance(), &path).await;
		assert_ne!(
			chunks[0].rows[0].venue_transaction_id,
			chunks[0].rows[1].venue_transaction_id
		);
	}

	#[tokio::test]
	async fn resume_cursor_skips_already_read_rows() {
		let (_dir, path) = write_csv(TRADE_CSV);
		let adapter = CsvLedgerAdapter::binance();
		let chunks: Vec<RawChunk> = adapter
			.execute_streaming(&ProviderOperation::ReadCsvRows {
				path,
				cursor: Some(Cursor::new(CursorPosition::Sequence(1), Some("binance-csv"))),
			})
			.collect::<Vec<_>>()
			.await
			.into_iter()
			.collect::<Result<_, _>>()
			.unwrap();
		assert_eq!(chunks[0].rows.len(), 1);
		assert_eq!(chunks[0].rows[0].payload["Market"], "ETHUSDT");
	}

	#[tokio::test]
	async fn unknown_schema_is_malformed() {
		let (_dir, path) = write_csv("a,b,c\n1,2,3\n");
		let result: Vec<_> = CsvLedgerAdapter::binance()
			.execute_streaming(&ProviderOperation::ReadCsvRows { path, cursor: None })
			.collect::<Vec<_>>()
			.await;
		assert!(matches!(result[0], Err(ProviderError::Malformed { .. })));
	}

	#[tokio::test]
	async fn missing_file_is_a_transport_error() {
		let result: Vec<_> = CsvLedgerAdapter::binance()
			.execute_streaming(&ProviderOperation::ReadCsvRows {
				path: "/nonexistent/export.csv".into(),
				cursor: None,
			})
			.collect::<Vec<_>>()
			.await;
		assert!(matches!(result[0], Err(ProviderError::Transport { .. })));
	}
}
