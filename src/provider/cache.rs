//! TTL cache for successful provider responses.
//!
//! Expiry is strict: an expired entry is dropped on lookup, so a stale value
//! can never shadow a provider that has started failing.

use std::{
	collections::HashMap,
	sync::Mutex,
	time::{Duration, Instant},
};

use super::ProviderResponse;

struct CacheEntry {
	stored_at: Instant,
	response: ProviderResponse,
}

pub struct ResponseCache {
	ttl: Duration,
	entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
	pub fn new(ttl: Duration) -> Self {
		Self { ttl, entries: Mutex::new(HashMap::new()) }
	}

	pub fn get(&self, key: &str) -> Option<ProviderResponse> {
		let mut entries = self.entries.lock().expect("cache lock poisoned");
		match entries.get(key) {
			Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.response.clone()),
			Some(_) => {
				entries.remove(key);
				None
			},
			None => None,
		}
	}

	pub fn insert(&self, key: String, response: ProviderResponse) {
		let mut entries = self.entries.lock().expect("cache lock poisoned");
		entries.insert(key, CacheEntry { stored_at: Instant::now(), response });
	}

	pub fn clear(&self) {
		self.entries.lock().expect("cache lock poisoned").clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn response(v: u64) -> ProviderResponse {
		ProviderResponse {
			data: serde_json::json!({ "v": v }),
			provider_name: "test".to_string(),
		}
	}

	#[test]
	fn fresh_entry_is_served() {
		let cache = ResponseCache::new(Duration::from_secs(30));
		cache.insert("k".to_string(), response(1));
		assert_eq!(cache.get("k"), Some(response(1)));
	}

	#[tokio::test]
	async fn expired_entry_is_dropped_not_served() {
		let cache = ResponseCache::new(Duration::from_millis(10));
		cache.insert("k".to_string(), response(1));
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(cache.get("k"), None);
		// And it stays gone; the miss removed it.
		assert_eq!(cache.get("k"), None);
	}

	#[test]
	fn clear_empties_the_cache() {
		let cache = ResponseCache::new(Duration::from_secs(30));
		cache.insert("k".to_string(), response(1));
		cache.clear();
		assert_eq!(cache.get("k"), None);
	}
}
