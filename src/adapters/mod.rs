//! Reference provider adapters and their canonical mappers.
//!
//! Each venue family lives in its own module: `evm` speaks the
//! etherscan-compatible explorer API, `exchange_csv` drives local exchange
//! exports, `exchange_api` the HMAC-signed exchange ledger REST surface.

pub mod evm;
pub mod exchange_api;
pub mod exchange_csv;

use sha2::{Digest, Sha256};

/// Short deterministic digest of a venue payload, used to give rows without
/// a venue id (or with a shared hash) a stable discriminator. serde_json
/// serializes object keys sorted, so the digest is order-independent.
pub(crate) fn payload_digest(payload: &serde_json::Value) -> String {
	let canonical = serde_json::to_string(payload).unwrap_or_default();
	let mut hasher = Sha256::new();
	hasher.update(canonical.as_bytes());
	hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn digest_is_stable_and_key_order_independent() {
		let a = serde_json::json!({ "b": 1, "a": "x" });
		let b = serde_json::from_str::<serde_json::Value>(r#"{"a":"x","b":1}"#).unwrap();
		assert_eq!(payload_digest(&a), payload_digest(&b));
		assert_eq!(payload_digest(&a).len(), 16);
	}

	#[test]
	fn digest_differs_for_different_payloads() {
		let a = serde_json::json!({ "value": "1" });
		let b = serde_json::json!({ "value": "2" });
		assert_ne!(payload_digest(&a), payload_digest(&b));
	}
}
