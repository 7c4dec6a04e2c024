//! HD wallet support: derive child addresses from an xpub parent account and
//! gap-scan them for on-chain activity.
//!
//! Derivation walks the receive chain (`/0/i`) of the exported xpub for each
//! configured address scheme. Scanning stops after the configured number of
//! consecutive unused addresses across every checked chain. A provider error
//! mid-scan aborts the whole scan; nothing is committed.

use std::sync::Arc;

use bitcoin::{
	bip32::{ChildNumber, ExtendedPubKey},
	secp256k1::Secp256k1,
	Address, Network, PublicKey,
};
use serde::{Deserialize, Serialize};

use crate::{
	errors::IngestError,
	provider::{ProviderManager, ProviderOperation},
	settings::GapScanSettings,
	store::AccountRegistry,
	types::{Account, AccountSpec, AccountType},
};

/// Address form derived for a scheme. The same xpub yields a different
/// address per scheme; operators configure which ones their wallet used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DerivationScheme {
	/// BIP-44 legacy P2PKH.
	Bip44,
	/// BIP-49 P2SH-wrapped segwit.
	Bip49,
	/// BIP-84 native segwit.
	Bip84,
}

impl DerivationScheme {
	pub fn as_str(&self) -> &'static str {
		match self {
			DerivationScheme::Bip44 => "bip44",
			DerivationScheme::Bip49 => "bip49",
			DerivationScheme::Bip84 => "bip84",
		}
	}

	fn address(&self, key: &PublicKey, network: Network) -> Result<Address, IngestError> {
		match self {
			DerivationScheme::Bip44 => Ok(Address::p2pkh(key, network)),
			DerivationScheme::Bip49 => Address::p2shwpkh(key, network).map_err(|e| {
				IngestError::GapScan { message: format!("p2sh-wpkh derivation failed: {e}") }
			}),
			DerivationScheme::Bip84 => Address::p2wpkh(key, network).map_err(|e| {
				IngestError::GapScan { message: format!("p2wpkh derivation failed: {e}") }
			}),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedAddress {
	pub scheme: DerivationScheme,
	pub index: u32,
	pub address: String,
	pub used: bool,
}

/// Derive and activity-scan one scheme's receive chain.
///
/// Returns the addresses to keep: everything up to `last_used + gap_limit`.
/// An xpub with no activity at all keeps nothing.
pub async fn scan_scheme(
	pm: &ProviderManager,
	xpub: &str,
	scheme: DerivationScheme,
	sources: &[String],
	settings: &GapScanSettings,
	network: Network,
) -> Result<Vec<DerivedAddress>, IngestError> {
	let parent: ExtendedPubKey = xpub.parse().map_err(|e| {
		IngestError::invalid_input("xpub", format!("unparseable extended public key: {e}"))
	})?;
	let secp = Secp256k1::verification_only();
	let receive_chain = ChildNumber::from_normal_idx(0)
		.map_err(|e| IngestError::GapScan { message: e.to_string() })?;

	let mut derived = Vec::new();
	let mut last_used: Option<u32> = None;
	let mut consecutive_unused = 0u32;

	for index in 0..settings.max_addresses {
		let child_index = ChildNumber::from_normal_idx(index)
			.map_err(|e| IngestError::GapScan { message: e.to_string() })?;
		let child = parent
			.derive_pub(&secp, &[receive_chain, child_index])
			.map_err(|e| IngestError::GapScan {
				message: format!("derivation of /0/{index} failed: {e}"),
			})?;
		let address = scheme.address(&child.to_pub(), network)?.to_string();

		let used = address_has_activity(pm, &address, sources).await?;
		if used {
			last_used = Some(index);
			consecutive_unused = 0;
		} else {
			consecutive_unused += 1;
		}
		derived.push(DerivedAddress { scheme, index, address, used });

		if consecutive_unused >= settings.gap_limit {
			break;
		}
	}

	let keep = match last_used {
		Some(last_used) => (last_used + settings.gap_limit + 1).min(derived.len() as u32),
		None => 0,
	};
	derived.truncate(keep as usize);
	tracing::info!(
		scheme = scheme.as_str(),
		kept = derived.len(),
		last_used = ?last_used,
		"gap scan finished"
	);
	Ok(derived)
}

/// Activity across all checked chains. Any provider error surfaces; a scan
/// that cannot see one chain must not silently under-derive.
async fn address_has_activity(
	pm: &ProviderManager,
	address: &str,
	sources: &[String],
) -> Result<bool, IngestError> {
	for source in sources {
		let response = pm
			.execute(
				source,
				&ProviderOperation::HasAddressTransactions { address: address.to_string() },
				None,
			)
			.await
			.map_err(|e| IngestError::GapScan {
				message: format!("activity check for {address} on {source} failed: {e}"),
			})?;
		if response.data.as_bool().unwrap_or(false) {
			return Ok(true);
		}
	}
	Ok(false)
}

/// Scan every configured scheme for the xpub parent and register the kept
/// addresses as child accounts. Children are only written once the entire
/// scan has succeeded.
pub async fn scan_and_register(
	pm: &Arc<ProviderManager>,
	accounts: &AccountRegistry,
	parent: &Account,
	schemes: &[DerivationScheme],
	sources: &[String],
	settings: &GapScanSettings,
	network: Network,
) -> Result<Vec<Account>, IngestError> {
	let mut derived = Vec::new();
	for scheme in schemes {
		derived.extend(
			scan_scheme(pm, &parent.identifier, *scheme, sources, settings, network).await?,
		);
	}

	let mut children = Vec::with_capacity(derived.len());
	for address in &derived {
		let spec = AccountSpec {
			user_id: parent.user_id.clone(),
			..AccountSpec::new(AccountType::Blockchain, &parent.source_name, &address.address)
		}
		.with_parent(parent.id);
		children.push(accounts.find_or_create(&spec).await?);
	}
	Ok(children)
}
