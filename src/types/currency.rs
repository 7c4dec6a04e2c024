use serde::{Deserialize, Serialize};

/// Broad asset classification. Drives downstream pricing and reporting, not
/// ingestion behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
	Crypto,
	Fiat,
	Nft,
}

impl AssetClass {
	pub fn as_str(&self) -> &'static str {
		match self {
			AssetClass::Crypto => "crypto",
			AssetClass::Fiat => "fiat",
			AssetClass::Nft => "nft",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"crypto" => Some(AssetClass::Crypto),
			"fiat" => Some(AssetClass::Fiat),
			"nft" => Some(AssetClass::Nft),
			_ => None,
		}
	}
}

/// A currency row. Immutable once created; the store deduplicates on
/// (symbol, network, contract_address).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
	pub symbol: String,
	pub decimals: u32,
	pub asset_class: AssetClass,
	pub network: Option<String>,
	pub contract_address: Option<String>,
	pub is_native: bool,
}

impl Currency {
	pub fn new(symbol: &str, decimals: u32, asset_class: AssetClass) -> Self {
		Self {
			symbol: symbol.to_uppercase(),
			decimals,
			asset_class,
			network: None,
			contract_address: None,
			is_native: false,
		}
	}

	pub fn crypto(symbol: &str, decimals: u32) -> Self {
		Self::new(symbol, decimals, AssetClass::Crypto)
	}

	pub fn fiat(symbol: &str, decimals: u32) -> Self {
		Self::new(symbol, decimals, AssetClass::Fiat)
	}

	pub fn native(symbol: &str, decimals: u32, network: &str) -> Self {
		Self {
			network: Some(network.to_string()),
			is_native: true,
			..Self::crypto(symbol, decimals)
		}
	}

	pub fn token(symbol: &str, decimals: u32, network: &str, contract: &str) -> Self {
		Self {
			network: Some(network.to_string()),
			contract_address: Some(contract.to_string()),
			..Self::crypto(symbol, decimals)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn symbol_is_uppercased() {
		assert_eq!(Currency::crypto("btc", 8).symbol, "BTC");
	}

	#[test]
	fn token_carries_network_and_contract() {
		let usdt = Currency::token("USDT", 6, "ethereum", "0xdac17f958d2ee523a2206206994597c13d831ec7");
		assert_eq!(usdt.network.as_deref(), Some("ethereum"));
		assert!(!usdt.is_native);
	}
}
