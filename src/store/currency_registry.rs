use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::types::{AssetClass, Currency};

use super::{Database, StoreError};

/// Currency rows are created on first reference and never deleted.
#[derive(Clone)]
pub struct CurrencyRegistry {
	db: Database,
}

impl CurrencyRegistry {
	pub fn new(db: Database) -> Self {
		Self { db }
	}

	/// Insert the currency if it is not known yet; existing rows win, so a
	/// later caller cannot change decimals or asset class.
	pub async fn ensure(&self, currency: &Currency) -> Result<i64, StoreError> {
		let currency = currency.clone();
		self.db
			.with_conn(move |conn| {
				let existing: Option<i64> = conn
					.query_row(
						"SELECT id FROM currencies
						 WHERE symbol = ?1
						   AND IFNULL(network, '') = IFNULL(?2, '')
						   AND IFNULL(contract_address, '') = IFNULL(?3, '')",
						params![currency.symbol, currency.network, currency.contract_address],
						|row| row.get(0),
					)
					.optional()?;
				if let Some(id) = existing {
					return Ok(id);
				}
				conn.execute(
					"INSERT INTO currencies
						(symbol, decimals, asset_class, network, contract_address, is_native, created_at)
					 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
					params![
						currency.symbol,
						currency.decimals,
						currency.asset_class.as_str(),
						currency.network,
						currency.contract_address,
						currency.is_native,
						Utc::now(),
					],
				)?;
				Ok(conn.last_insert_rowid())
			})
			.await
	}

	/// Lookup by symbol alone; first created row wins when a symbol exists
	/// on several networks.
	pub async fn find(&self, symbol: &str) -> Result<Option<Currency>, StoreError> {
		let symbol = symbol.to_uppercase();
		self.db
			.with_conn(move |conn| {
				conn.query_row(
					"SELECT symbol, decimals, asset_class, network, contract_address, is_native
					 FROM currencies WHERE symbol = ?1 ORDER BY id LIMIT 1",
					params![symbol],
					row_to_currency,
				)
				.optional()
				.map_err(StoreError::from)
			})
			.await
	}

	pub async fn find_exact(
		&self,
		symbol: &str,
		network: Option<&str>,
		contract_address: Option<&str>,
	) -> Result<Option<Currency>, StoreError> {
		let symbol = symbol.to_uppercase();
		let network = network.map(str::to_string);
		let contract_address = contract_address.map(str::to_string);
		self.db
			.with_conn(move |conn| {
				conn.query_row(
					"SELECT symbol, decimals, asset_class, network, contract_address, is_native
					 FROM currencies
					 WHERE symbol = ?1
					   AND IFNULL(network, '') = IFNULL(?2, '')
					   AND IFNULL(contract_address, '') = IFNULL(?3, '')",
					params![symbol, network, contract_address],
					row_to_currency,
				)
				.optional()
				.map_err(StoreError::from)
			})
			.await
	}
}

fn row_to_currency(row: &rusqlite::Row<'_>) -> Result<Currency, rusqlite::Error> {
	let asset_class: String = row.get(2)?;
	Ok(Currency {
		symbol: row.get(0)?,
		decimals: row.get(1)?,
		asset_class: AssetClass::parse(&asset_class).unwrap_or(AssetClass::Crypto),
		network: row.get(3)?,
		contract_address: row.get(4)?,
		is_native: row.get(5)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn ensure_is_idempotent() {
		let registry = CurrencyRegistry::new(Database::open_in_memory().unwrap());
		let btc = Currency::crypto("BTC", 8);
		let first = registry.ensure(&btc).await.unwrap();
		let second = registry.ensure(&btc).await.unwrap();
		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn first_definition_wins() {
		let registry = CurrencyRegistry::new(Database::open_in_memory().unwrap());
		registry.ensure(&Currency::crypto("ETH", 18)).await.unwrap();
		registry.ensure(&Currency::crypto("ETH", 9)).await.unwrap();
		assert_eq!(registry.find("ETH").await.unwrap().unwrap().decimals, 18);
	}

	#[tokio::test]
	async fn same_symbol_on_two_networks_is_two_rows() {
		let registry = CurrencyRegistry::new(Database::open_in_memory().unwrap());
		let native = Currency::native("ETH", 18, "ethereum");
		let bridged = Currency::token("ETH", 18, "arbitrum", "0xdeadbeef");
		assert_ne!(
			registry.ensure(&native).await.unwrap(),
			registry.ensure(&bridged).await.unwrap()
		);
		let exact = registry
			.find_exact("ETH", Some("arbitrum"), Some("0xdeadbeef"))
			.await
			.unwrap()
			.unwrap();
		assert!(!exact.is_native);
	}
}
