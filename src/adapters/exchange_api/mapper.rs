use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, TimeZone, Utc};

use crate::{
	processor::{MappingError, SessionMetadata, TransactionMapper},
	types::{
		CanonicalTransaction, Direction, Fee, Movement, Operation, OperationCategory,
		OperationType, RawTransaction, TransactionStatus,
	},
};

/// Quote-side assets used to tell buys and sells apart from generic swaps.
const QUOTE_ASSETS: &[&str] = &["USD", "EUR", "GBP", "USDT", "USDC", "DAI"];

/// Maps Kraken ledger entries. The two legs of a trade share a `refid` and
/// correlate into one canonical trade; deposits, withdrawals and staking
/// rewards map individually.
pub struct KrakenLedgerMapper;

impl TransactionMapper for KrakenLedgerMapper {
	fn correlation_key(&self, row: &RawTransaction) -> Option<String> {
		let entry_type = row.payload.get("type").and_then(|v| v.as_str())?;
		if matches!(entry_type, "trade" | "spend" | "receive") {
			row.payload.get("refid").and_then(|v| v.as_str()).map(str::to_string)
		} else {
			None
		}
	}

	fn map(
		&self,
		rows: &[RawTransaction],
		session: &SessionMetadata,
	) -> Result<Option<CanonicalTransaction>, MappingError> {
		let entry_type = rows[0]
			.payload
			.get("type")
			.and_then(|v| v.as_str())
			.ok_or(MappingError::MissingField { field: "type" })?;
		match entry_type {
			"trade" | "spend" | "receive" => map_trade_legs(rows, session),
			"deposit" => map_transfer(&rows[0], session, Direction::Inflow),
			"withdrawal" => map_transfer(&rows[0], session, Direction::Outflow),
			"staking" | "earn" => map_staking(&rows[0], session),
			// Sub-account shuffles have no external balance effect.
			"transfer" => Ok(None),
			other => Err(MappingError::UnrecognizedRow {
				message: format!("unknown ledger entry type {other}"),
			}),
		}
	}
}

fn map_trade_legs(
	rows: &[RawTransaction],
	session: &SessionMetadata,
) -> Result<Option<CanonicalTransaction>, MappingError> {
	if rows.len() != 2 {
		return Err(MappingError::IncompleteGroup {
			message: format!("trade refid has {} leg(s), expected 2", rows.len()),
		});
	}

	let mut tx = CanonicalTransaction::new(
		external_id(&rows[0]),
		&session.source_name,
		entry_datetime(&rows[0])?,
		TransactionStatus::Closed,
		Operation::trade(OperationType::Swap),
	);
	tx.metadata = serde_json::json!({ "refid": rows[0].payload.get("refid") });

	let mut inflow_asset = None;
	let mut outflow_asset = None;
	for row in rows {
		let asset = normalize_asset(
			row.payload
				.get("asset")
				.and_then(|v| v.as_str())
				.ok_or(MappingError::MissingField { field: "asset" })?,
		);
		let amount = entry_decimal(row, "amount")?;
		if amount >= BigDecimal::zero() {
			inflow_asset = Some(asset.clone());
			tx.movements.push(Movement::inflow(&asset, amount));
		} else {
			outflow_asset = Some(asset.clone());
			tx.movements.push(Movement::outflow(&asset, -amount));
		}
		let fee = entry_decimal(row, "fee")?;
		if !fee.is_zero() {
			tx.fees.push(Fee::platform_balance(fee, &asset));
		}
	}

	let is_quote = |asset: &Option<String>| {
		asset.as_deref().is_some_and(|a| QUOTE_ASSETS.contains(&a))
	};
	tx.operation = if is_quote(&outflow_asset) {
		Operation::trade(OperationType::Buy)
	} else if is_quote(&inflow_asset) {
		Operation::trade(OperationType::Sell)
	} else {
		Operation::trade(OperationType::Swap)
	};
	Ok(Some(tx))
}

fn map_transfer(
	row: &RawTransaction,
	session: &SessionMetadata,
	direction: Direction,
) -> Result<Option<CanonicalTransaction>, MappingError> {
	let asset = normalize_asset(
		row.payload
			.get("asset")
			.and_then(|v| v.as_str())
			.ok_or(MappingError::MissingField { field: "asset" })?,
	);
	let amount = entry_decimal(row, "amount")?;
	let mut tx = CanonicalTransaction::new(
		external_id(row),
		&session.source_name,
		entry_datetime(row)?,
		TransactionStatus::Closed,
		match direction {
			Direction::Inflow => Operation::transfer(OperationType::Deposit),
			Direction::Outflow => Operation::transfer(OperationType::Withdrawal),
		},
	);
	tx.movements.push(match direction {
		Direction::Inflow => Movement::inflow(&asset, amount),
		Direction::Outflow => Movement::outflow(&asset, -amount),
	});
	// The venue debits its withdrawal fee separately from the amount.
	let fee = entry_decimal(row, "fee")?;
	if !fee.is_zero() {
		tx.fees.push(Fee::platform_balance(fee, &asset));
	}
	Ok(Some(tx))
}

fn map_staking(
	row: &RawTransaction,
	session: &SessionMetadata,
) -> Result<Option<CanonicalTransaction>, MappingError> {
	let asset = normalize_asset(
		row.payload
			.get("asset")
			.and_then(|v| v.as_str())
			.ok_or(MappingError::MissingField { field: "asset" })?,
	);
	let amount = entry_decimal(row, "amount")?;
	if amount <= BigDecimal::zero() {
		return Ok(None);
	}
	let mut tx = CanonicalTransaction::new(
		external_id(row),
		&session.source_name,
		entry_datetime(row)?,
		TransactionStatus::Closed,
		Operation::new(OperationCategory::Staking, OperationType::Reward),
	);
	tx.movements.push(Movement::inflow(&asset, amount));
	Ok(Some(tx))
}

fn external_id(row: &RawTransaction) -> &str {
	row.payload
		.get("refid")
		.and_then(|v| v.as_str())
		.unwrap_or(&row.venue_transaction_id)
}

fn entry_decimal(row: &RawTransaction, field: &'static str) -> Result<BigDecimal, MappingError> {
	match row.payload.get(field) {
		Some(serde_json::Value::String(text)) => BigDecimal::from_str(text).map_err(|_| {
			MappingError::InvalidDecimal { field, value: text.clone() }
		}),
		Some(serde_json::Value::Number(number)) => BigDecimal::from_str(&number.to_string())
			.map_err(|_| MappingError::InvalidDecimal { field, value: number.to_string() }),
		_ => Err(MappingError::MissingField { field }),
	}
}

fn entry_datetime(row: &RawTransaction) -> Result<DateTime<Utc>, MappingError> {
	let time = row
		.payload
		.get("time")
		.and_then(|v| v.as_f64())
		.ok_or(MappingError::MissingField { field: "time" })?;
	Utc.timestamp_opt(time as i64, 0)
		.single()
		.ok_or(MappingError::InvalidTimestamp { value: time.to_string() })
}

/// Kraken's legacy asset codes: XXBT → BTC, ZUSD → USD, XETH → ETH.
fn normalize_asset(asset: &str) -> String {
	match asset {
		"XXBT" | "XBT" => return "BTC".to_string(),
		"XXDG" | "XDG" => return "DOGE".to_string(),
		_ => {},
	}
	let stripped = match asset {
		a if a.len() == 4 && (a.starts_with('X') || a.starts_with('Z')) => &a[1..],
		a => a,
	};
	stripped.to_uppercase()
}

#[cfg(test)]
mod tests {
	use crate::types::{FeeScope, FeeSettlement, ProcessingStatus, TransactionKind};

	use super::*;

	fn session() -> SessionMetadata {
		SessionMetadata {
			session_id: 1,
			account_id: 1,
			source_name: "kraken".to_string(),
			identifier: "main".to_string(),
			user_id: None,
		}
	}

	fn entry(ledger_id: &str, payload: serde_json::Value) -> RawTransaction {
		RawTransaction {
			id: 1,
			session_id: 1,
			source_name: "kraken".to_string(),
			provider_name: "kraken-rest".to_string(),
			venue_transaction_id: ledger_id.to_string(),
			transaction_type_hint: TransactionKind::Ledger,
			source_address: None,
			payload,
			normalized_preview: None,
			event_id: String::new(),
			processing_status: ProcessingStatus::Pending,
			error: None,
			created_at: Utc::now(),
		}
	}

	fn dec(s: &str) -> BigDecimal {
		BigDecimal::from_str(s).unwrap()
	}

	#[test]
	fn trade_legs_with_usd_outflow_map_to_buy() {
		let rows = [
			entry(
				"L1",
				serde_json::json!({
					"refid": "TRADE-1", "time": 1_700_000_000.1, "type": "trade",
					"asset": "XXBT", "amount": "0.1", "fee": "0", "balance": "1.1",
				}),
			),
			entry(
				"L2",
				serde_json::json!({
					"refid": "TRADE-1", "time": 1_700_000_000.1, "type": "trade",
					"asset": "ZUSD", "amount": "-4200.00", "fee": "8.40", "balance": "100",
				}),
			),
		];
		assert_eq!(
			KrakenLedgerMapper.correlation_key(&rows[0]).as_deref(),
			Some("TRADE-1")
		);

		let tx = KrakenLedgerMapper.map(&rows, &session()).unwrap().unwrap();
		tx.validate().unwrap();
		assert_eq!(tx.operation, Operation::trade(OperationType::Buy));
		assert_eq!(tx.external_id, "TRADE-1");
		assert_eq!(tx.net_change("BTC"), dec("0.1"));
		assert_eq!(tx.net_change("USD"), dec("-4200"));
		assert_eq!(tx.fees.len(), 1);
		assert_eq!(tx.fees[0].currency, "USD");
		assert_eq!(tx.fees[0].scope, FeeScope::Platform);
		assert_eq!(tx.fees[0].settlement, FeeSettlement::Balance);
	}

	#[test]
	fn crypto_to_crypto_refid_is_a_swap() {
		let rows = [
			entry(
				"L1",
				serde_json::json!({
					"refid": "T2", "time": 1_700_000_000.0, "type": "trade",
					"asset": "XETH", "amount": "-2", "fee": "0",
				}),
			),
			entry(
				"L2",
				serde_json::json!({
					"refid": "T2", "time": 1_700_000_000.0, "type": "trade",
					"asset": "XXBT", "amount": "0.11", "fee": "0",
				}),
			),
		];
		let tx = KrakenLedgerMapper.map(&rows, &session()).unwrap().unwrap();
		assert_eq!(tx.operation, Operation::trade(OperationType::Swap));
	}

	#[test]
	fn lone_trade_leg_is_incomplete() {
		let rows = [entry(
			"L1",
			serde_json::json!({
				"refid": "T3", "time": 1_700_000_000.0, "type": "trade",
				"asset": "XXBT", "amount": "0.1", "fee": "0",
			}),
		)];
		assert_eq!(
			KrakenLedgerMapper.map(&rows, &session()).unwrap_err().code(),
			"INCOMPLETE_GROUP"
		);
	}

	#[test]
	fn withdrawal_keeps_fee_out_of_the_movement() {
		let row = entry(
			"L9",
			serde_json::json!({
				"refid": "W1", "time": 1_700_000_000.0, "type": "withdrawal",
				"asset": "XXBT", "amount": "-0.25", "fee": "0.0005",
			}),
		);
		let tx = KrakenLedgerMapper.map(&[row], &session()).unwrap().unwrap();
		tx.validate().unwrap();
		assert_eq!(tx.movements[0].gross_amount, dec("0.25"));
		assert_eq!(tx.movements[0].net_amount, dec("0.25"));
		assert_eq!(tx.fees[0].amount, dec("0.0005"));
		assert_eq!(tx.fees[0].settlement, FeeSettlement::Balance);
	}

	#[test]
	fn deposit_and_staking_map_to_inflows() {
		let deposit = entry(
			"L3",
			serde_json::json!({
				"refid": "D1", "time": 1_700_000_000.0, "type": "deposit",
				"asset": "ZUSD", "amount": "1000", "fee": "0",
			}),
		);
		let tx = KrakenLedgerMapper.map(&[deposit], &session()).unwrap().unwrap();
		assert_eq!(tx.operation, Operation::transfer(OperationType::Deposit));

		let reward = entry(
			"L4",
			serde_json::json!({
				"refid": "S1", "time": 1_700_000_000.0, "type": "staking",
				"asset": "ETH2.S", "amount": "0.01", "fee": "0",
			}),
		);
		let tx = KrakenLedgerMapper.map(&[reward], &session()).unwrap().unwrap();
		assert_eq!(tx.operation.category, OperationCategory::Staking);
	}

	#[test]
	fn internal_transfers_are_skipped() {
		let row = entry(
			"L5",
			serde_json::json!({
				"refid": "X1", "time": 1_700_000_000.0, "type": "transfer",
				"asset": "XXBT", "amount": "1", "fee": "0",
			}),
		);
		assert_eq!(KrakenLedgerMapper.map(&[row], &session()).unwrap(), None);
	}

	#[test]
	fn asset_codes_are_normalized() {
		assert_eq!(normalize_asset("XXBT"), "BTC");
		assert_eq!(normalize_asset("ZUSD"), "USD");
		assert_eq!(normalize_asset("XETH"), "ETH");
		assert_eq!(normalize_asset("ZEUR"), "EUR");
		assert_eq!(normalize_asset("SOL"), "SOL");
		assert_eq!(normalize_asset("XXDG"), "DOGE");
	}
}
