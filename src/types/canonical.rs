use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
	Inflow,
	Outflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
	Ok,
	Pending,
	Failed,
	Closed,
}

impl TransactionStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			TransactionStatus::Ok => "ok",
			TransactionStatus::Pending => "pending",
			TransactionStatus::Failed => "failed",
			TransactionStatus::Closed => "closed",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"ok" => Some(TransactionStatus::Ok),
			"pending" => Some(TransactionStatus::Pending),
			"failed" => Some(TransactionStatus::Failed),
			"closed" => Some(TransactionStatus::Closed),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationCategory {
	Trade,
	Transfer,
	Staking,
	Fee,
	Other,
}

impl OperationCategory {
	pub fn as_str(&self) -> &'static str {
		match self {
			OperationCategory::Trade => "trade",
			OperationCategory::Transfer => "transfer",
			OperationCategory::Staking => "staking",
			OperationCategory::Fee => "fee",
			OperationCategory::Other => "other",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"trade" => Some(OperationCategory::Trade),
			"transfer" => Some(OperationCategory::Transfer),
			"staking" => Some(OperationCategory::Staking),
			"fee" => Some(OperationCategory::Fee),
			"other" => Some(OperationCategory::Other),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
	Buy,
	Sell,
	Swap,
	Deposit,
	Withdrawal,
	Reward,
	Fee,
	Other,
}

impl OperationType {
	pub fn as_str(&self) -> &'static str {
		match self {
			OperationType::Buy => "buy",
			OperationType::Sell => "sell",
			OperationType::Swap => "swap",
			OperationType::Deposit => "deposit",
			OperationType::Withdrawal => "withdrawal",
			OperationType::Reward => "reward",
			OperationType::Fee => "fee",
			OperationType::Other => "other",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"buy" => Some(OperationType::Buy),
			"sell" => Some(OperationType::Sell),
			"swap" => Some(OperationType::Swap),
			"deposit" => Some(OperationType::Deposit),
			"withdrawal" => Some(OperationType::Withdrawal),
			"reward" => Some(OperationType::Reward),
			"fee" => Some(OperationType::Fee),
			"other" => Some(OperationType::Other),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
	pub category: OperationCategory,
	#[serde(rename = "type")]
	pub kind: OperationType,
}

impl Operation {
	pub fn new(category: OperationCategory, kind: OperationType) -> Self {
		Self { category, kind }
	}

	pub fn trade(kind: OperationType) -> Self {
		Self { category: OperationCategory::Trade, kind }
	}

	pub fn transfer(kind: OperationType) -> Self {
		Self { category: OperationCategory::Transfer, kind }
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
	pub amount: BigDecimal,
	pub currency: String,
}

/// One asset flow inside a canonical transaction. Amounts are positive; the
/// direction carries the sign. `net_amount` equals `gross_amount` unless a
/// same-asset on-chain network fee reduced the transmitted amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub movement_id: Option<String>,
	pub direction: Direction,
	pub asset: String,
	pub gross_amount: BigDecimal,
	pub net_amount: BigDecimal,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub price_at_tx_time: Option<Price>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<serde_json::Value>,
}

impl Movement {
	pub fn inflow(asset: &str, amount: BigDecimal) -> Self {
		Self {
			movement_id: None,
			direction: Direction::Inflow,
			asset: asset.to_uppercase(),
			net_amount: amount.clone(),
			gross_amount: amount,
			price_at_tx_time: None,
			metadata: None,
		}
	}

	pub fn outflow(asset: &str, amount: BigDecimal) -> Self {
		Self {
			movement_id: None,
			direction: Direction::Outflow,
			asset: asset.to_uppercase(),
			net_amount: amount.clone(),
			gross_amount: amount,
			price_at_tx_time: None,
			metadata: None,
		}
	}

	pub fn with_id(mut self, movement_id: &str) -> Self {
		self.movement_id = Some(movement_id.to_string());
		self
	}

	pub fn with_net(mut self, net_amount: BigDecimal) -> Self {
		self.net_amount = net_amount;
		self
	}

	pub fn with_price(mut self, amount: BigDecimal, currency: &str) -> Self {
		self.price_at_tx_time = Some(Price { amount, currency: currency.to_uppercase() });
		self
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeScope {
	Network,
	Platform,
	Spread,
	Tax,
	Other,
}

impl FeeScope {
	pub fn as_str(&self) -> &'static str {
		match self {
			FeeScope::Network => "network",
			FeeScope::Platform => "platform",
			FeeScope::Spread => "spread",
			FeeScope::Tax => "tax",
			FeeScope::Other => "other",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"network" => Some(FeeScope::Network),
			"platform" => Some(FeeScope::Platform),
			"spread" => Some(FeeScope::Spread),
			"tax" => Some(FeeScope::Tax),
			"other" => Some(FeeScope::Other),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeeSettlement {
	OnChain,
	Balance,
	External,
}

impl FeeSettlement {
	pub fn as_str(&self) -> &'static str {
		match self {
			FeeSettlement::OnChain => "on-chain",
			FeeSettlement::Balance => "balance",
			FeeSettlement::External => "external",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"on-chain" => Some(FeeSettlement::OnChain),
			"balance" => Some(FeeSettlement::Balance),
			"external" => Some(FeeSettlement::External),
			_ => None,
		}
	}
}

/// A fee kept separate from movement amounts. Only a (network, on-chain) fee
/// is reflected in a movement's net amount; everything else is its own
/// balance effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fee {
	pub amount: BigDecimal,
	pub currency: String,
	pub scope: FeeScope,
	pub settlement: FeeSettlement,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub funded_from_movement_id: Option<String>,
}

impl Fee {
	pub fn network_on_chain(amount: BigDecimal, currency: &str, funded_from: &str) -> Self {
		Self {
			amount,
			currency: currency.to_uppercase(),
			scope: FeeScope::Network,
			settlement: FeeSettlement::OnChain,
			funded_from_movement_id: Some(funded_from.to_string()),
		}
	}

	pub fn platform_balance(amount: BigDecimal, currency: &str) -> Self {
		Self {
			amount,
			currency: currency.to_uppercase(),
			scope: FeeScope::Platform,
			settlement: FeeSettlement::Balance,
			funded_from_movement_id: None,
		}
	}
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
	#[error("transaction has neither movements nor fees")]
	Empty,
	#[error("movement {index} has non-positive gross amount {amount}")]
	NonPositiveMovement { index: usize, amount: String },
	#[error("movement {index} has negative net amount {amount}")]
	NegativeNet { index: usize, amount: String },
	#[error("movement {index} net {net} exceeds gross {gross}")]
	NetExceedsGross { index: usize, gross: String, net: String },
	#[error("movement {index} net differs from gross but no matching on-chain network fee found")]
	NetWithoutNetworkFee { index: usize },
	#[error("movement {index} net/gross delta {delta} does not equal its network fee {fee}")]
	NetworkFeeMismatch { index: usize, delta: String, fee: String },
	#[error("fee {index} has non-positive amount {amount}")]
	NonPositiveFee { index: usize, amount: String },
	#[error("fee {index} references movement {movement_id} which does not exist")]
	DanglingFeeReference { index: usize, movement_id: String },
	#[error("fee {index} settles on-chain in {fee_currency} but funds from a {movement_asset} movement")]
	FeeAssetMismatch { index: usize, fee_currency: String, movement_asset: String },
	#[error("trade must have exactly one inflow and one outflow in distinct assets")]
	MalformedTrade,
}

impl ValidationError {
	pub fn code(&self) -> &'static str {
		match self {
			ValidationError::Empty => "EMPTY_TRANSACTION",
			ValidationError::NonPositiveMovement { .. } => "NON_POSITIVE_MOVEMENT",
			ValidationError::NegativeNet { .. } => "NEGATIVE_NET",
			ValidationError::NetExceedsGross { .. } => "NET_EXCEEDS_GROSS",
			ValidationError::NetWithoutNetworkFee { .. } => "NET_WITHOUT_NETWORK_FEE",
			ValidationError::NetworkFeeMismatch { .. } => "NETWORK_FEE_MISMATCH",
			ValidationError::NonPositiveFee { .. } => "NON_POSITIVE_FEE",
			ValidationError::DanglingFeeReference { .. } => "DANGLING_FEE_REFERENCE",
			ValidationError::FeeAssetMismatch { .. } => "FEE_ASSET_MISMATCH",
			ValidationError::MalformedTrade => "MALFORMED_TRADE",
		}
	}
}

/// The canonical, venue-agnostic record of one user transaction.
/// Unique on (external_id, source); reversal is a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTransaction {
	pub external_id: String,
	pub source: String,
	/// Unix milliseconds, as reported by the venue.
	pub timestamp: i64,
	pub datetime: DateTime<Utc>,
	pub status: TransactionStatus,
	pub operation: Operation,
	pub movements: Vec<Movement>,
	pub fees: Vec<Fee>,
	#[serde(default = "default_metadata")]
	pub metadata: serde_json::Value,
}

fn default_metadata() -> serde_json::Value {
	serde_json::Value::Object(Default::default())
}

impl CanonicalTransaction {
	pub fn new(
		external_id: &str,
		source: &str,
		datetime: DateTime<Utc>,
		status: TransactionStatus,
		operation: Operation,
	) -> Self {
		Self {
			external_id: external_id.to_string(),
			source: source.to_string(),
			timestamp: datetime.timestamp_millis(),
			datetime,
			status,
			operation,
			movements: Vec::new(),
			fees: Vec::new(),
			metadata: default_metadata(),
		}
	}

	/// Net balance effect for one asset: sum of inflow nets minus outflow
	/// nets. On-chain network fees are already inside the nets and must not
	/// be subtracted again by callers.
	pub fn net_change(&self, asset: &str) -> BigDecimal {
		let mut total = BigDecimal::zero();
		for m in &self.movements {
			if m.asset == asset {
				match m.direction {
					Direction::Inflow => total += &m.net_amount,
					Direction::Outflow => total -= &m.net_amount,
				}
			}
		}
		total
	}

	/// Structural and fee/movement consistency checks. Mappers run through
	/// this before anything is persisted; a failure quarantines the raw row.
	pub fn validate(&self) -> Result<(), ValidationError> {
		// Fee-only records (e.g. a failed contract call that still burned
		// gas) carry no movements; everything else needs at least one.
		if self.movements.is_empty() && self.fees.is_empty() {
			return Err(ValidationError::Empty);
		}

		for (index, m) in self.movements.iter().enumerate() {
			if m.gross_amount <= BigDecimal::zero() {
				return Err(ValidationError::NonPositiveMovement {
					index,
					amount: m.gross_amount.to_string(),
				});
			}
			if m.net_amount < BigDecimal::zero() {
				return Err(ValidationError::NegativeNet {
					index,
					amount: m.net_amount.to_string(),
				});
			}
			if m.net_amount > m.gross_amount {
				return Err(ValidationError::NetExceedsGross {
					index,
					gross: m.gross_amount.to_string(),
					net: m.net_amount.to_string(),
				});
			}
			if m.net_amount != m.gross_amount {
				let delta = &m.gross_amount - &m.net_amount;
				let fee = self.fees.iter().find(|f| {
					f.scope == FeeScope::Network
						&& f.settlement == FeeSettlement::OnChain
						&& f.currency == m.asset
						&& f.funded_from_movement_id.is_some()
						&& f.funded_from_movement_id == m.movement_id
				});
				match fee {
					None => return Err(ValidationError::NetWithoutNetworkFee { index }),
					Some(fee) if fee.amount != delta => {
						return Err(ValidationError::NetworkFeeMismatch {
							index,
							delta: delta.to_string(),
							fee: fee.amount.to_string(),
						})
					},
					Some(_) => {},
				}
			}
		}

		for (index, f) in self.fees.iter().enumerate() {
			if f.amount <= BigDecimal::zero() {
				return Err(ValidationError::NonPositiveFee {
					index,
					amount: f.amount.to_string(),
				});
			}
			if let Some(movement_id) = &f.funded_from_movement_id {
				let movement = self
					.movements
					.iter()
					.find(|m| m.movement_id.as_deref() == Some(movement_id.as_str()));
				match movement {
					None => {
						return Err(ValidationError::DanglingFeeReference {
							index,
							movement_id: movement_id.clone(),
						})
					},
					Some(m)
						if f.settlement == FeeSettlement::OnChain && f.currency != m.asset =>
					{
						return Err(ValidationError::FeeAssetMismatch {
							index,
							fee_currency: f.currency.clone(),
							movement_asset: m.asset.clone(),
						})
					},
					Some(_) => {},
				}
			}
		}

		if self.operation.category == OperationCategory::Trade {
			let inflows =
				self.movements.iter().filter(|m| m.direction == Direction::Inflow).count();
			let outflows =
				self.movements.iter().filter(|m| m.direction == Direction::Outflow).count();
			let distinct =
				self.movements.iter().map(|m| m.asset.as_str()).unique().count();
			if inflows != 1 || outflows != 1 || distinct != 2 {
				return Err(ValidationError::MalformedTrade);
			}
		}

		Ok(())
	}
}
