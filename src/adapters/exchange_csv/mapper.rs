use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::{
	processor::{MappingError, SessionMetadata, TransactionMapper},
	types::{
		CanonicalTransaction, Fee, Movement, Operation, OperationCategory, OperationType,
		RawTransaction, TransactionStatus,
	},
};

/// Quote assets recognized when splitting a market symbol like "BTCUSDT".
/// Longest match wins so "BTCBUSD" resolves to BUSD, not USD-something.
const QUOTE_ASSETS: &[&str] = &[
	"USDT", "BUSD", "USDC", "TUSD", "FDUSD", "BTC", "ETH", "BNB", "EUR", "TRY", "USD", "DAI",
];

/// Maps Binance CSV exports: spot trade-history rows individually, account
/// statement rows grouped by correlation key (convert pairs, withdraw+fee
/// clusters).
pub struct BinanceCsvMapper;

impl TransactionMapper for BinanceCsvMapper {
	fn correlation_key(&self, row: &RawTransaction) -> Option<String> {
		if field(&row.payload, "schema") != Some("statement") {
			return None;
		}
		let time = field(&row.payload, "UTC_Time")?;
		match field(&row.payload, "Operation")? {
			"Convert Market" => {
				let remark = field(&row.payload, "Remark").unwrap_or_default();
				Some(format!("cm|{time}|{remark}"))
			},
			"Withdraw" | "Fee" => Some(format!("wf|{time}")),
			_ => None,
		}
	}

	fn map(
		&self,
		rows: &[RawTransaction],
		session: &SessionMetadata,
	) -> Result<Option<CanonicalTransaction>, MappingError> {
		match field(&rows[0].payload, "schema") {
			Some("trade") => map_trade(&rows[0], session),
			Some("statement") => map_statement(rows, session),
			other => Err(MappingError::UnrecognizedRow {
				message: format!("unknown CSV schema tag {other:?}"),
			}),
		}
	}
}

fn map_trade(
	row: &RawTransaction,
	session: &SessionMetadata,
) -> Result<Option<CanonicalTransaction>, MappingError> {
	let payload = &row.payload;
	let market = required(payload, "Market")?;
	let (base, quote) = split_market(market)?;
	let side = required(payload, "Type")?.to_uppercase();
	let amount = decimal(payload, "Amount")?;
	let price = optional_decimal(payload, "Price")?;
	// The quote side is inferred from price when the export omits Total.
	let total = match optional_decimal(payload, "Total")? {
		Some(total) => total,
		None => {
			let price = price.clone().ok_or(MappingError::MissingField { field: "Total" })?;
			&price * &amount
		},
	};

	let (operation, base_movement, quote_movement) = match side.as_str() {
		"BUY" => (
			Operation::trade(OperationType::Buy),
			Movement::inflow(&base, amount),
			Movement::outflow(&quote, total),
		),
		"SELL" => (
			Operation::trade(OperationType::Sell),
			Movement::outflow(&base, amount),
			Movement::inflow(&quote, total),
		),
		other => {
			return Err(MappingError::UnrecognizedRow {
				message: format!("unknown trade side {other}"),
			})
		},
	};

	let mut tx = CanonicalTransaction::new(
		&row.venue_transaction_id,
		&session.source_name,
		csv_datetime(required(payload, "Date(UTC)")?)?,
		TransactionStatus::Closed,
		operation,
	);
	tx.metadata = serde_json::json!({ "market": market });
	let base_movement = match price {
		Some(price) => base_movement.with_price(price, &quote),
		None => base_movement,
	};
	tx.movements.push(base_movement);
	tx.movements.push(quote_movement);

	if let Some(fee) = optional_decimal(payload, "Fee")? {
		if !fee.is_zero() {
			let fee_coin = required(payload, "Fee Coin")?;
			tx.fees.push(Fee::platform_balance(fee, fee_coin));
		}
	}
	Ok(Some(tx))
}

fn map_statement(
	rows: &[RawTransaction],
	session: &SessionMetadata,
) -> Result<Option<CanonicalTransaction>, MappingError> {
	let operations: Vec<&str> = rows
		.iter()
		.map(|r| field(&r.payload, "Operation").unwrap_or_default())
		.collect();

	if operations.iter().all(|op| *op == "Convert Market") {
		return map_convert(rows, session);
	}
	if operations.iter().any(|op| matches!(*op, "Withdraw" | "Fee")) {
		return map_withdrawal_cluster(rows, session);
	}
	match operations[0] {
		"Deposit" => map_deposit(&rows[0], session),
		// Account-history transfer entries shuffle funds between venue
		// sub-accounts; skipped per venue policy. Trade legs are covered by
		// the trade-history export.
		"Transfer" | "Buy" | "Sell" | "Transaction Related" => Ok(None),
		other => Err(MappingError::UnrecognizedRow {
			message: format!("unknown statement operation {other}"),
		}),
	}
}

/// Two opposite same-timestamp rows tagged "Convert Market" form one swap.
fn map_convert(
	rows: &[RawTransaction],
	session: &SessionMetadata,
) -> Result<Option<CanonicalTransaction>, MappingError> {
	if rows.len() != 2 {
		return Err(MappingError::IncompleteGroup {
			message: format!("convert pair has {} leg(s), expected 2", rows.len()),
		});
	}
	let mut tx = CanonicalTransaction::new(
		&rows[0].venue_transaction_id,
		&session.source_name,
		csv_datetime(required(&rows[0].payload, "UTC_Time")?)?,
		TransactionStatus::Closed,
		Operation::trade(OperationType::Swap),
	);
	tx.metadata = serde_json::json!({ "type": "convert_market" });

	for row in rows {
		let coin = required(&row.payload, "Coin")?;
		let change = decimal(&row.payload, "Change")?;
		tx.movements.push(if change >= BigDecimal::zero() {
			Movement::inflow(coin, change)
		} else {
			Movement::outflow(coin, -change)
		});
	}
	Ok(Some(tx))
}

/// A withdraw row plus any fee rows debited in the same second. The fee's
/// ledger debit is real, so the fee asset also gets an outflow movement.
fn map_withdrawal_cluster(
	rows: &[RawTransaction],
	session: &SessionMetadata,
) -> Result<Option<CanonicalTransaction>, MappingError> {
	let withdraws: Vec<&RawTransaction> = rows
		.iter()
		.filter(|r| field(&r.payload, "Operation") == Some("Withdraw"))
		.collect();
	let fees: Vec<&RawTransaction> =
		rows.iter().filter(|r| field(&r.payload, "Operation") == Some("Fee")).collect();
	if withdraws.len() > 1 {
		return Err(MappingError::IncompleteGroup {
			message: format!(
				"{} withdrawals share one timestamp; cannot attribute fees",
				withdraws.len()
			),
		});
	}

	let anchor = withdraws.first().copied().unwrap_or(&rows[0]);
	let mut tx = CanonicalTransaction::new(
		&anchor.venue_transaction_id,
		&session.source_name,
		csv_datetime(required(&anchor.payload, "UTC_Time")?)?,
		TransactionStatus::Closed,
		if withdraws.is_empty() {
			Operation::new(OperationCategory::Fee, OperationType::Fee)
		} else {
			Operation::transfer(OperationType::Withdrawal)
		},
	);

	if let Some(withdraw) = withdraws.first() {
		let coin = required(&withdraw.payload, "Coin")?;
		let change = decimal(&withdraw.payload, "Change")?;
		// Venue fees never reduce the withdrawn amount; they are their own
		// ledger debit.
		tx.movements.push(Movement::outflow(coin, -change));
	}
	for fee_row in fees {
		let coin = required(&fee_row.payload, "Coin")?;
		let amount = -decimal(&fee_row.payload, "Change")?;
		tx.movements.push(Movement::outflow(coin, amount.clone()));
		tx.fees.push(Fee::platform_balance(amount, coin));
	}
	Ok(Some(tx))
}

fn map_deposit(
	row: &RawTransaction,
	session: &SessionMetadata,
) -> Result<Option<CanonicalTransaction>, MappingError> {
	let coin = required(&row.payload, "Coin")?;
	let change = decimal(&row.payload, "Change")?;
	let mut tx = CanonicalTransaction::new(
		&row.venue_transaction_id,
		&session.source_name,
		csv_datetime(required(&row.payload, "UTC_Time")?)?,
		TransactionStatus::Closed,
		Operation::transfer(OperationType::Deposit),
	);
	tx.movements.push(Movement::inflow(coin, change));
	Ok(Some(tx))
}

fn field<'a>(payload: &'a serde_json::Value, name: &str) -> Option<&'a str> {
	payload.get(name).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn required<'a>(
	payload: &'a serde_json::Value,
	name: &'static str,
) -> Result<&'a str, MappingError> {
	field(payload, name).ok_or(MappingError::MissingField { field: name })
}

fn decimal(payload: &serde_json::Value, name: &'static str) -> Result<BigDecimal, MappingError> {
	let text = required(payload, name)?;
	BigDecimal::from_str(text)
		.map_err(|_| MappingError::InvalidDecimal { field: name, value: text.to_string() })
}

fn optional_decimal(
	payload: &serde_json::Value,
	name: &'static str,
) -> Result<Option<BigDecimal>, MappingError> {
	match field(payload, name) {
		None => Ok(None),
		Some(text) => BigDecimal::from_str(text)
			.map(Some)
			.map_err(|_| MappingError::InvalidDecimal { field: name, value: text.to_string() }),
	}
}

fn csv_datetime(text: &str) -> Result<DateTime<Utc>, MappingError> {
	NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
		.map(|naive| Utc.from_utc_datetime(&naive))
		.map_err(|_| MappingError::InvalidTimestamp { value: text.to_string() })
}

fn split_market(market: &str) -> Result<(String, String), MappingError> {
	for quote in QUOTE_ASSETS {
		if let Some(base) = market.strip_suffix(quote) {
			if !base.is_empty() {
				return Ok((base.to_string(), quote.to_string()));
			}
		}
	}
	Err(MappingError::UnrecognizedRow { message: format!("cannot split market {market}") })
}
