//! Etherscan-compatible explorer adapter.
//!
//! Etherscan and Blockscout expose the same `module=account` wire format, so
//! one adapter serves both providers; only name, base URL and the beacon
//! withdrawal capability differ.

mod mapper;

pub use mapper::EvmTransactionMapper;

use std::time::Instant;

use async_trait::async_trait;

use crate::{
	adapters::payload_digest,
	constants::DEFAULT_EVM_REPLAY_BLOCKS,
	provider::{
		ChunkStats, ChunkStream, OperationKind, ProviderAdapter, ProviderCapabilities,
		ProviderError, ProviderOperation, RateLimitSpec, RawChunk, RawRow,
	},
	types::{Cursor, CursorPosition, TransactionKind},
};

const PAGE_SIZE: usize = 1000;

#[derive(Clone)]
pub struct ExplorerAdapter {
	name: String,
	source: String,
	base_url: String,
	api_key: Option<String>,
	client: reqwest::Client,
	capabilities: ProviderCapabilities,
	rate_limit: RateLimitSpec,
	replay_blocks: u64,
}

impl ExplorerAdapter {
	pub fn etherscan(api_key: Option<String>, replay_blocks: Option<u64>) -> Self {
		Self::new(
			"etherscan",
			"ethereum",
			"https://api.etherscan.io/api",
			api_key,
			[
				TransactionKind::Normal,
				TransactionKind::Internal,
				TransactionKind::Token,
				TransactionKind::BeaconWithdrawal,
			],
			RateLimitSpec { requests_per_sec: 5.0, burst: 5 },
			replay_blocks,
		)
	}

	pub fn blockscout(replay_blocks: Option<u64>) -> Self {
		// Blockscout's etherscan-compatible shim has no beacon withdrawal
		// action.
		Self::new(
			"blockscout",
			"ethereum",
			"https://eth.blockscout.com/api",
			None,
			[TransactionKind::Normal, TransactionKind::Internal, TransactionKind::Token],
			RateLimitSpec { requests_per_sec: 10.0, burst: 10 },
			replay_blocks,
		)
	}

	fn new(
		name: &str,
		source: &str,
		base_url: &str,
		api_key: Option<String>,
		kinds: impl IntoIterator<Item = TransactionKind>,
		rate_limit: RateLimitSpec,
		replay_blocks: Option<u64>,
	) -> Self {
		Self {
			name: name.to_string(),
			source: source.to_string(),
			base_url: base_url.to_string(),
			api_key,
			client: reqwest::Client::new(),
			capabilities: ProviderCapabilities::new(
				[
					OperationKind::GetRawAddressTransactions,
					OperationKind::GetAddressTransactions,
					OperationKind::GetAddressBalance,
					OperationKind::HasAddressTransactions,
				],
				kinds,
			),
			rate_limit,
			replay_blocks: replay_blocks.unwrap_or(DEFAULT_EVM_REPLAY_BLOCKS),
		}
	}

	fn action_for(kind: TransactionKind) -> &'static str {
		match kind {
			TransactionKind::Internal => "txlistinternal",
			TransactionKind::Token => "tokentx",
			TransactionKind::BeaconWithdrawal => "txsBeaconWithdrawal",
			_ => "txlist",
		}
	}

	fn account_url(&self, action: &str, address: &str, start_block: u64, offset: usize) -> String {
		let mut url = format!(
			"{}?module=account&action={action}&address={address}&startblock={start_block}\
			 &endblock=999999999&page=1&offset={offset}&sort=asc",
			self.base_url
		);
		if let Some(api_key) = &self.api_key {
			url.push_str(&format!("&apikey={api_key}"));
		}
		url
	}

	async fn fetch_rows(
		&self,
		action: &str,
		address: &str,
		start_block: u64,
		offset: usize,
	) -> Result<Vec<serde_json::Value>, ProviderError> {
		let url = self.account_url(action, address, start_block, offset);
		let response = self.client.get(&url).send().await.map_err(|e| {
			ProviderError::Transport {
				provider: self.name.clone(),
				operation: "get_address_transactions",
				message: e.to_string(),
			}
		})?;
		let body: serde_json::Value = response.json().await.map_err(|e| {
			ProviderError::Malformed { provider: self.name.clone(), message: e.to_string() }
		})?;
		parse_account_response(&self.name, body)
	}

	/// Stable per-row venue id. Normal transactions use the hash; internal
	/// and token rows share their parent hash, so they get a discriminator
	/// digested from fields every etherscan-compatible API reports
	/// identically (mutable fields like confirmations would break
	/// idempotency); beacon withdrawals have an index instead of a hash.
	fn venue_id(kind: TransactionKind, row: &serde_json::Value) -> String {
		let hash = row.get("hash").and_then(|v| v.as_str()).unwrap_or_default();
		let discriminator = |row: &serde_json::Value| {
			let mut stable = serde_json::Map::new();
			for field in ["hash", "from", "to", "value", "contractAddress", "tokenSymbol"] {
				if let Some(value) = row.get(field) {
					stable.insert(field.to_string(), value.clone());
				}
			}
			payload_digest(&serde_json::Value::Object(stable))
		};
		match kind {
			TransactionKind::Internal => match row.get("traceId").and_then(|v| v.as_str()) {
				Some(trace) => format!("{hash}#int-{trace}"),
				None => format!("{hash}#int-{}", discriminator(row)),
			},
			TransactionKind::Token => format!("{hash}#tok-{}", discriminator(row)),
			TransactionKind::BeaconWithdrawal => format!(
				"wd-{}",
				row.get("withdrawalIndex").and_then(|v| v.as_str()).unwrap_or_default()
			),
			_ => hash.to_string(),
		}
	}

	fn row_block(row: &serde_json::Value) -> u64 {
		row.get("blockNumber")
			.and_then(|v| v.as_str())
			.and_then(|s| s.parse().ok())
			.unwrap_or(0)
	}
}

/// Interpret the `{status, message, result}` envelope. An empty result set
/// is reported as status "0" with a message, not an error.
fn parse_account_response(
	provider: &str,
	body: serde_json::Value,
) -> Result<Vec<serde_json::Value>, ProviderError> {
	let status = body.get("status").and_then(|v| v.as_str()).unwrap_or_default();
	if status == "1" {
		return body
			.get("result")
			.and_then(|v| v.as_array())
			.cloned()
			.ok_or_else(|| ProviderError::Malformed {
				provider: provider.to_string(),
				message: "status 1 without a result array".to_string(),
			});
	}
	let detail = body
		.get("result")
		.and_then(|v| v.as_str())
		.or_else(|| body.get("message").and_then(|v| v.as_str()))
		.unwrap_or_default()
		.to_string();
	if detail.contains("No transactions found") {
		return Ok(Vec::new());
	}
	if detail.to_lowercase().contains("rate limit") {
		return Err(ProviderError::RateLimited {
			provider: provider.to_string(),
			retry_after_ms: None,
		});
	}
	if detail.contains("Invalid API Key") {
		return Err(ProviderError::CredentialsRejected {
			provider: provider.to_string(),
			message: detail,
		});
	}
	Err(ProviderError::Transport {
		provider: provider.to_string(),
		operation: "get_address_transactions",
		message: detail,
	})
}

#[async_trait]
impl ProviderAdapter for ExplorerAdapter {
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
		self.rate_limit
	}

	async fn execute(&self, op: &ProviderOperation) -> Result<serde_json::Value, ProviderError> {
		match op {
			ProviderOperation::GetAddressBalance { address } => {
				let mut url = format!(
					"{}?module=account&action=balance&address={address}&tag=latest",
					self.base_url
				);
				if let Some(api_key) = &self.api_key {
					url.push_str(&format!("&apikey={api_key}"));
				}
				let body: serde_json::Value = self
					.client
					.get(&url)
					.send()
					.await
					.map_err(|e| ProviderError::Transport {
						provider: self.name.clone(),
						operation: "get_address_balance",
						message: e.to_string(),
					})?
					.json()
					.await
					.map_err(|e| ProviderError::Malformed {
						provider: self.name.clone(),
						message: e.to_string(),
					})?;
				body.get("result").cloned().ok_or_else(|| ProviderError::Malformed {
					provider: self.name.clone(),
					message: "balance response without result".to_string(),
				})
			},
			ProviderOperation::HasAddressTransactions { address } => {
				let rows = self.fetch_rows("txlist", address, 0, 1).await?;
				Ok(serde_json::Value::Bool(!rows.is_empty()))
			},
			ProviderOperation::GetAddressTransactions { address, transaction_type, cursor } => {
				let start = cursor_block(cursor.as_ref());
				let rows = self
					.fetch_rows(Self::action_for(*transaction_type), address, start, PAGE_SIZE)
					.await?;
				Ok(serde_json::Value::Array(rows))
			},
			ProviderOperation::GetRawAddressTransactions { address, cursor } => {
				let start = cursor_block(cursor.as_ref());
				let rows = self.fetch_rows("txlist", address, start, PAGE_SIZE).await?;
				Ok(serde_json::Value::Array(rows))
			},
			_ => Err(ProviderError::Unsupported {
				provider: self.name.clone(),
				operation: op.name(),
			}),
		}
	}

	fn execute_streaming(&self, op: &ProviderOperation) -> ChunkStream {
		let (address, kind) = match op {
			ProviderOperation::GetAddressTransactions { address, transaction_type, .. } => {
				(address.clone(), *transaction_type)
			},
			ProviderOperation::GetRawAddressTransactions { address, .. } => {
				(address.clone(), TransactionKind::Normal)
			},
			other => {
				let error = ProviderError::Unsupported {
					provider: self.name.clone(),
					operation: other.name(),
				};
				return Box::pin(futures::stream::once(async move { Err(error) }));
			},
		};
		let adapter = self.clone();
		let mut start_block = cursor_block(op.cursor());
		let mut total_fetched = op.cursor().map(|c| c.total_fetched).unwrap_or(0);

		Box::pin(async_stream::stream! {
			loop {
				let started = Instant::now();
				let rows = match adapter
					.fetch_rows(Self::action_for(kind), &address, start_block, PAGE_SIZE)
					.await
				{
					Ok(rows) => rows,
					Err(error) => {
						yield Err(error);
						return;
					},
				};
				let latency_ms = started.elapsed().as_millis() as u64;

				let max_block =
					rows.iter().map(Self::row_block).max().unwrap_or(start_block);
				let is_complete = rows.len() < PAGE_SIZE;
				total_fetched += rows.len() as u64;

				let raw_rows: Vec<RawRow> = rows
					.iter()
					.map(|row| RawRow {
						venue_transaction_id: Self::venue_id(kind, row),
						kind,
						source_address: Some(address.clone()),
						payload: row.clone(),
						normalized_preview: None,
					})
					.collect();

				let mut cursor =
					Cursor::new(CursorPosition::BlockNumber(max_block), Some(&adapter.name));
				cursor.last_transaction_id =
					raw_rows.last().map(|r| r.venue_transaction_id.clone());
				cursor.total_fetched = total_fetched;
				cursor.metadata.is_complete = is_complete;

				yield Ok(RawChunk {
					stats: ChunkStats { fetched: raw_rows.len() as u32, latency_ms },
					rows: raw_rows,
					provider_name: adapter.name.clone(),
					cursor,
					is_complete,
				});
				if is_complete {
					return;
				}
				// Re-fetch the boundary block; downstream dedup absorbs the
				// overlap. A page entirely inside one block must still move.
				start_block = if max_block == start_block { max_block + 1 } else { max_block };
			}
		})
	}

	async fn is_healthy(&self) -> Result<bool, ProviderError> {
		let mut url = format!("{}?module=proxy&action=eth_blockNumber", self.base_url);
		if let Some(api_key) = &self.api_key {
			url.push_str(&format!("&apikey={api_key}"));
		}
		match self.client.get(&url).send().await {
			Ok(response) => Ok(response.status().is_success()),
			Err(_) => Ok(false),
		}
	}

	fn extract_cursors(&self, row: &RawRow) -> Vec<Cursor> {
		let mut cursors = Vec::new();
		let block = Self::row_block(&row.payload);
		if block > 0 {
			cursors.push(Cursor::new(CursorPosition::BlockNumber(block), Some(&self.name)));
		}
		if let Some(ts) = row
			.payload
			.get("timeStamp")
			.and_then(|v| v.as_str())
			.and_then(|s| s.parse::<i64>().ok())
		{
			cursors.push(Cursor::new(CursorPosition::Timestamp(ts), Some(&self.name)));
		}
		cursors
	}

	fn apply_replay_window(&self, cursor: &Cursor) -> Cursor {
		let mut replayed = cursor.clone();
		if let CursorPosition::BlockNumber(block) = replayed.primary {
			replayed.primary =
				CursorPosition::BlockNumber(block.saturating_sub(self.replay_blocks));
			replayed.metadata.replay_window = Some(self.replay_blocks);
		}
		replayed
	}
}

fn cursor_block(cursor: Option<&Cursor>) -> u64 {
	match cursor {
		Some(Cursor { primary: CursorPosition::BlockNumber(block), .. }) => *block,
		_ => 0,
	}
}
