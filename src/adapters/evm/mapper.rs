use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, TimeZone, Utc};
use num_bigint::BigInt;

use crate::{
	processor::{MappingError, SessionMetadata, TransactionMapper},
	types::{
		CanonicalTransaction, Currency, Fee, FeeScope, FeeSettlement, Movement, Operation,
		OperationCategory, OperationType, RawTransaction, TransactionKind, TransactionStatus,
	},
};

const WEI_SCALE: i64 = 18;
const GWEI_SCALE: i64 = 9;

/// Maps etherscan-format rows. One mapper serves every provider speaking
/// that format; rows never correlate, each maps on its own.
pub struct EvmTransactionMapper;

impl EvmTransactionMapper {
	fn map_normal(
		&self,
		row: &RawTransaction,
		me: &str,
	) -> Result<Option<CanonicalTransaction>, MappingError> {
		let payload = &row.payload;
		let from = field_str(payload, "from")?.to_lowercase();
		let to = payload.get("to").and_then(|v| v.as_str()).unwrap_or_default().to_lowercase();
		let value = scaled_decimal(payload, "value", WEI_SCALE)?;
		let fee = gas_fee(payload)?;
		let failed =
			payload.get("isError").and_then(|v| v.as_str()).is_some_and(|e| e == "1");
		let status = if failed { TransactionStatus::Failed } else { TransactionStatus::Closed };
		let datetime = row_datetime(payload)?;

		let outgoing = from == me;
		let incoming = to == me;
		if !outgoing && !incoming {
			return Ok(None);
		}
		if !outgoing && value.is_zero() {
			// Incoming zero-value call; no balance effect for us.
			return Ok(None);
		}

		let mut tx = CanonicalTransaction::new(
			&row.venue_transaction_id,
			&row.source_name,
			datetime,
			status,
			if outgoing {
				Operation::transfer(OperationType::Withdrawal)
			} else {
				Operation::transfer(OperationType::Deposit)
			},
		);
		tx.metadata = serde_json::json!({
			"block_number": payload.get("blockNumber"),
			"from": from,
			"to": to,
		});

		if outgoing {
			if value.is_zero() {
				// Contract interaction that only burned gas.
				tx.operation = Operation::new(OperationCategory::Fee, OperationType::Fee);
				tx.fees.push(Fee {
					amount: fee,
					currency: "ETH".to_string(),
					scope: FeeScope::Network,
					settlement: FeeSettlement::OnChain,
					funded_from_movement_id: None,
				});
			} else if fee < value && !fee.is_zero() {
				let net = &value - &fee;
				tx.movements
					.push(Movement::outflow("ETH", value).with_id("m0").with_net(net));
				tx.fees.push(Fee::network_on_chain(fee, "ETH", "m0"));
			} else {
				tx.movements.push(Movement::outflow("ETH", value).with_id("m0"));
				if !fee.is_zero() {
					tx.fees.push(Fee {
						amount: fee,
						currency: "ETH".to_string(),
						scope: FeeScope::Network,
						settlement: FeeSettlement::OnChain,
						funded_from_movement_id: None,
					});
				}
			}
			if incoming {
				// Self-transfer: the inflow side, undiminished.
				tx.movements.push(Movement::inflow("ETH", scaled_decimal(payload, "value", WEI_SCALE)?));
			}
		} else {
			tx.movements.push(Movement::inflow("ETH", value));
		}
		Ok(Some(tx))
	}

	fn map_internal(
		&self,
		row: &RawTransaction,
		me: &str,
	) -> Result<Option<CanonicalTransaction>, MappingError> {
		let payload = &row.payload;
		let from = field_str(payload, "from")?.to_lowercase();
		let to = payload.get("to").and_then(|v| v.as_str()).unwrap_or_default().to_lowercase();
		let value = scaled_decimal(payload, "value", WEI_SCALE)?;
		if value.is_zero() {
			return Ok(None);
		}

		let direction_in = to == me;
		if !direction_in && from != me {
			return Ok(None);
		}
		let mut tx = CanonicalTransaction::new(
			&row.venue_transaction_id,
			&row.source_name,
			row_datetime(payload)?,
			TransactionStatus::Closed,
			if direction_in {
				Operation::transfer(OperationType::Deposit)
			} else {
				Operation::transfer(OperationType::Withdrawal)
			},
		);
		tx.metadata = serde_json::json!({
			"block_number": payload.get("blockNumber"),
			"internal": true,
		});
		// Gas for internal transfers is paid by the parent transaction.
		tx.movements.push(if direction_in {
			Movement::inflow("ETH", value)
		} else {
			Movement::outflow("ETH", value)
		});
		Ok(Some(tx))
	}

	fn map_token(
		&self,
		row: &RawTransaction,
		me: &str,
	) -> Result<Option<CanonicalTransaction>, MappingError> {
		let payload = &row.payload;
		let from = field_str(payload, "from")?.to_lowercase();
		let to = payload.get("to").and_then(|v| v.as_str()).unwrap_or_default().to_lowercase();
		let symbol = field_str(payload, "tokenSymbol")?.to_uppercase();
		let decimals = token_decimals(payload)?;
		let value = scaled_decimal(payload, "value", decimals as i64)?;
		if value.is_zero() {
			return Ok(None);
		}

		let direction_in = to == me;
		if !direction_in && from != me {
			return Ok(None);
		}
		let mut tx = CanonicalTransaction::new(
			&row.venue_transaction_id,
			&row.source_name,
			row_datetime(payload)?,
			TransactionStatus::Closed,
			if direction_in {
				Operation::transfer(OperationType::Deposit)
			} else {
				Operation::transfer(OperationType::Withdrawal)
			},
		);
		tx.metadata = serde_json::json!({
			"block_number": payload.get("blockNumber"),
			"contract_address": payload.get("contractAddress"),
		});
		tx.movements.push(if direction_in {
			Movement::inflow(&symbol, value)
		} else {
			Movement::outflow(&symbol, value)
		});
		Ok(Some(tx))
	}

	fn map_beacon_withdrawal(
		&self,
		row: &RawTransaction,
	) -> Result<Option<CanonicalTransaction>, MappingError> {
		let payload = &row.payload;
		// Beacon withdrawal amounts are denominated in gwei.
		let amount = scaled_decimal(payload, "amount", GWEI_SCALE)?;
		if amount.is_zero() {
			return Ok(None);
		}
		let mut tx = CanonicalTransaction::new(
			&row.venue_transaction_id,
			&row.source_name,
			row_datetime(payload)?,
			TransactionStatus::Closed,
			Operation::new(OperationCategory::Staking, OperationType::Reward),
		);
		tx.metadata = serde_json::json!({
			"validator_index": payload.get("validatorIndex"),
			"withdrawal_index": payload.get("withdrawalIndex"),
		});
		tx.movements.push(Movement::inflow("ETH", amount));
		Ok(Some(tx))
	}
}

impl TransactionMapper for EvmTransactionMapper {
	fn map(
		&self,
		rows: &[RawTransaction],
		session: &SessionMetadata,
	) -> Result<Option<CanonicalTransaction>, MappingError> {
		let row = &rows[0];
		let me = session.identifier.to_lowercase();
		match row.transaction_type_hint {
			TransactionKind::Normal => self.map_normal(row, &me),
			TransactionKind::Internal => self.map_internal(row, &me),
			TransactionKind::Token => self.map_token(row, &me),
			TransactionKind::BeaconWithdrawal => self.map_beacon_withdrawal(row),
			other => Err(MappingError::UnrecognizedRow {
				message: format!("unexpected transaction kind {} for an EVM row", other.as_str()),
			}),
		}
	}

	fn currencies(
		&self,
		rows: &[RawTransaction],
		tx: &CanonicalTransaction,
	) -> Vec<Currency> {
		let mut currencies = vec![Currency::native("ETH", 18, "ethereum")];
		for row in rows {
			if row.transaction_type_hint == TransactionKind::Token {
				if let (Some(symbol), Ok(decimals), Some(contract)) = (
					row.payload.get("tokenSymbol").and_then(|v| v.as_str()),
					token_decimals(&row.payload),
					row.payload.get("contractAddress").and_then(|v| v.as_str()),
				) {
					currencies.push(Currency::token(symbol, decimals, "ethereum", contract));
				}
			}
		}
		currencies.retain(|c| {
			tx.movements.iter().any(|m| m.asset == c.symbol)
				|| tx.fees.iter().any(|f| f.currency == c.symbol)
		});
		currencies
	}
}

fn field_str<'a>(
	payload: &'a serde_json::Value,
	field: &'static str,
) -> Result<&'a str, MappingError> {
	payload
		.get(field)
		.and_then(|v| v.as_str())
		.ok_or(MappingError::MissingField { field })
}

/// Integer venue amount at a fixed scale, e.g. wei → ETH at scale 18.
/// Exact: no floats, no rounding.
fn scaled_decimal(
	payload: &serde_json::Value,
	field: &'static str,
	scale: i64,
) -> Result<BigDecimal, MappingError> {
	let text = field_str(payload, field)?;
	let digits = BigInt::from_str(text)
		.map_err(|_| MappingError::InvalidDecimal { field, value: text.to_string() })?;
	Ok(BigDecimal::new(digits, scale))
}

fn gas_fee(payload: &serde_json::Value) -> Result<BigDecimal, MappingError> {
	let gas_used = payload.get("gasUsed").and_then(|v| v.as_str()).unwrap_or("0");
	let gas_price = payload.get("gasPrice").and_then(|v| v.as_str()).unwrap_or("0");
	let gas_used = BigInt::from_str(gas_used).map_err(|_| MappingError::InvalidDecimal {
		field: "gasUsed",
		value: gas_used.to_string(),
	})?;
	let gas_price = BigInt::from_str(gas_price).map_err(|_| MappingError::InvalidDecimal {
		field: "gasPrice",
		value: gas_price.to_string(),
	})?;
	Ok(BigDecimal::new(gas_used * gas_price, WEI_SCALE))
}

fn row_datetime(payload: &serde_json::Value) -> Result<DateTime<Utc>, MappingError> {
	// txlist-family rows use timeStamp; beacon withdrawals use timestamp.
	let text = payload
		.get("timeStamp")
		.or_else(|| payload.get("timestamp"))
		.and_then(|v| v.as_str())
		.ok_or(MappingError::MissingField { field: "timeStamp" })?;
	let seconds = text
		.parse::<i64>()
		.map_err(|_| MappingError::InvalidTimestamp { value: text.to_string() })?;
	Utc.timestamp_opt(seconds, 0)
		.single()
		.ok_or(MappingError::InvalidTimestamp { value: text.to_string() })
}

fn token_decimals(payload: &serde_json::Value) -> Result<u32, MappingError> {
	let value = payload
		.get("tokenDecimal")
		.ok_or(MappingError::MissingField { field: "tokenDecimal" })?;
	match value {
		serde_json::Value::String(s) => s.parse().map_err(|_| MappingError::InvalidDecimal {
			field: "tokenDecimal",
			value: s.clone(),
		}),
		serde_json::Value::Number(n) => {
			n.as_u64().map(|n| n as u32).ok_or(MappingError::InvalidDecimal {
				field: "tokenDecimal",
				value: n.to_string(),
			})
		},
		other => Err(MappingError::InvalidDecimal {
			field: "tokenDecimal",
			value: other.to_string(),
		}),
	}
}
