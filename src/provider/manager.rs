//! Provider selection, failover and response caching.

use std::{
	sync::{Arc, RwLock},
	time::{Duration, Instant},
};

use futures::StreamExt;
use rand::Rng;
use tokio::time::timeout;

use crate::{
	constants::{DEFAULT_CACHE_TTL, DEFAULT_OPERATION_TIMEOUT},
	gate::{RateHealthGate, TokenBucket},
	types::{Cursor, TransactionKind},
};

use super::{
	cache::ResponseCache, ChunkStream, ProviderAdapter, ProviderError, ProviderOperation,
	ProviderResponse, RateLimitSpec,
};

#[derive(Debug, Clone)]
pub struct ProviderManagerConfig {
	pub cache_ttl: Duration,
	pub operation_timeout: Duration,
}

impl Default for ProviderManagerConfig {
	fn default() -> Self {
		Self { cache_ttl: DEFAULT_CACHE_TTL, operation_timeout: DEFAULT_OPERATION_TIMEOUT }
	}
}

/// Per-registration knobs, typically sourced from settings overrides.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistration {
	pub priority: u32,
	pub enabled: bool,
	pub rate_limit_override: Option<RateLimitSpec>,
}

impl ProviderRegistration {
	pub fn enabled_with_priority(priority: u32) -> Self {
		Self { priority, enabled: true, rate_limit_override: None }
	}
}

#[derive(Clone)]
struct RegisteredProvider {
	name: String,
	adapter: Arc<dyn ProviderAdapter>,
	limiter: Arc<TokenBucket>,
	priority: u32,
	enabled: bool,
}

/// Routes each operation to the best healthy, capability-matching provider.
/// Process-wide: all sessions share one manager, one gate and one cache.
pub struct ProviderManager {
	config: ProviderManagerConfig,
	gate: Arc<RateHealthGate>,
	cache: ResponseCache,
	providers: RwLock<Vec<RegisteredProvider>>,
}

impl ProviderManager {
	pub fn new(gate: Arc<RateHealthGate>, config: ProviderManagerConfig) -> Self {
		let cache = ResponseCache::new(config.cache_ttl);
		Self { config, gate, cache, providers: RwLock::new(Vec::new()) }
	}

	pub fn gate(&self) -> &Arc<RateHealthGate> {
		&self.gate
	}

	pub fn register(&self, adapter: Arc<dyn ProviderAdapter>, registration: ProviderRegistration) {
		let rate = registration.rate_limit_override.unwrap_or_else(|| adapter.rate_limit());
		let provider = RegisteredProvider {
			name: adapter.name().to_string(),
			limiter: Arc::new(TokenBucket::new(rate.requests_per_sec, rate.burst)),
			adapter,
			priority: registration.priority,
			enabled: registration.enabled,
		};
		tracing::info!(
			provider = %provider.name,
			source = provider.adapter.source(),
			priority = provider.priority,
			enabled = provider.enabled,
			"provider registered"
		);
		self.providers.write().expect("provider lock poisoned").push(provider);
	}

	/// Candidates for (source, op), best first: account preference, then
	/// priority, then observed latency, then failure rate.
	fn candidates(
		&self,
		source: &str,
		op: Option<&ProviderOperation>,
		preferred: Option<&str>,
	) -> Vec<RegisteredProvider> {
		let providers = self.providers.read().expect("provider lock poisoned");
		let mut matching: Vec<RegisteredProvider> = providers
			.iter()
			.filter(|p| p.enabled && p.adapter.source() == source)
			.filter(|p| op.map(|op| p.adapter.capabilities().supports(op)).unwrap_or(true))
			.cloned()
			.collect();
		drop(providers);

		let mut keyed: Vec<(bool, u32, u64, f64, RegisteredProvider)> = matching
			.drain(..)
			.map(|p| {
				let snap = self.gate.snapshot(&p.name);
				let not_preferred = preferred.map(|pref| p.name != pref).unwrap_or(false);
				(not_preferred, p.priority, snap.avg_latency_ms, snap.failure_rate, p)
			})
			.collect();
		keyed.sort_by(|a, b| {
			(a.0, a.1, a.2)
				.cmp(&(b.0, b.1, b.2))
				.then(a.3.total_cmp(&b.3))
		});
		keyed.into_iter().map(|(_, _, _, _, p)| p).collect()
	}

	/// Execute a single-shot operation with failover and caching.
	pub async fn execute(
		&self,
		source: &str,
		op: &ProviderOperation,
		preferred: Option<&str>,
	) -> Result<ProviderResponse, ProviderError> {
		let candidates = self.candidates(source, Some(op), preferred);
		if candidates.is_empty() {
			return Err(ProviderError::NoProviders {
				source_name: source.to_string(),
				operation: op.name(),
			});
		}

		let cache_key = op.cache_key(source);
		if let Some(key) = &cache_key {
			if let Some(hit) = self.cache.get(key) {
				tracing::trace!(key, "provider cache hit");
				return Ok(hit);
			}
		}

		let mut attempted = Vec::new();
		let mut last_error: Option<String> = None;
		for provider in candidates {
			if !self.gate.allow(&provider.name) {
				attempted.push(provider.name.clone());
				last_error.get_or_insert_with(|| format!("circuit open for {}", provider.name));
				continue;
			}
			if !attempted.is_empty() {
				// Jittered pause between failover attempts; a venue-wide
				// hiccup otherwise hits every provider back to back.
				let pause = rand::thread_rng().gen_range(10..50);
				tokio::time::sleep(Duration::from_millis(pause)).await;
			}
			provider.limiter.acquire().await;
			let started = Instant::now();
			let outcome = timeout(self.config.operation_timeout, provider.adapter.execute(op)).await;
			let latency_ms = started.elapsed().as_millis() as u64;
			match outcome {
				Ok(Ok(data)) => {
					self.gate.record_success(&provider.name, latency_ms);
					let response =
						ProviderResponse { data, provider_name: provider.name.clone() };
					if let Some(key) = cache_key {
						self.cache.insert(key, response.clone());
					}
					return Ok(response);
				},
				Ok(Err(error)) => {
					self.gate.record_failure(&provider.name, latency_ms, &error.to_string());
					if error.is_credentials() {
						return Err(error);
					}
					tracing::warn!(
						provider = %provider.name,
						operation = op.name(),
						%error,
						"provider call failed, trying next"
					);
					last_error = Some(error.to_string());
					attempted.push(provider.name.clone());
				},
				Err(_) => {
					let message = format!(
						"timed out after {}ms",
						self.config.operation_timeout.as_millis()
					);
					self.gate.record_failure(&provider.name, latency_ms, &message);
					last_error = Some(message);
					attempted.push(provider.name.clone());
				},
			}
		}

		Err(ProviderError::AllProvidersFailed {
			source_name: source.to_string(),
			operation: op.name(),
			attempted,
			last_error: last_error.unwrap_or_else(|| "no provider was callable".to_string()),
		})
	}

	/// Execute a streaming operation. Providers may be switched only between
	/// chunks; the replacement resumes from the last good chunk's cursor.
	pub fn execute_streaming(
		&self,
		source: &str,
		op: ProviderOperation,
		preferred: Option<&str>,
	) -> ChunkStream {
		let candidates = self.candidates(source, Some(&op), preferred);
		let gate = self.gate.clone();
		let operation_timeout = self.config.operation_timeout;
		let source = source.to_string();

		Box::pin(async_stream::stream! {
			if candidates.is_empty() {
				yield Err(ProviderError::NoProviders {
					source_name: source.clone(),
					operation: op.name(),
				});
				return;
			}

			let mut cursor: Option<Cursor> = op.cursor().cloned();
			let mut attempted: Vec<String> = Vec::new();
			let mut last_error: Option<String> = None;

			'providers: loop {
				let Some(provider) = candidates
					.iter()
					.find(|p| !attempted.contains(&p.name) && gate.allow(&p.name))
				else {
					for p in &candidates {
						if !attempted.contains(&p.name) {
							last_error
								.get_or_insert_with(|| format!("circuit open for {}", p.name));
							attempted.push(p.name.clone());
						}
					}
					yield Err(ProviderError::AllProvidersFailed {
						source_name: source.clone(),
						operation: op.name(),
						attempted: attempted.clone(),
						last_error: last_error
							.clone()
							.unwrap_or_else(|| "no provider was callable".to_string()),
					});
					return;
				};

				if !attempted.is_empty() {
					let pause = rand::thread_rng().gen_range(10..50);
					tokio::time::sleep(Duration::from_millis(pause)).await;
				}
				let positioned = op.with_cursor(cursor.clone());
				let mut inner = provider.adapter.execute_streaming(&positioned);
				loop {
					provider.limiter.acquire().await;
					let started = Instant::now();
					let next = timeout(operation_timeout, inner.next()).await;
					let latency_ms = started.elapsed().as_millis() as u64;
					match next {
						Ok(Some(Ok(chunk))) => {
							gate.record_success(&provider.name, latency_ms);
							cursor = Some(chunk.cursor.clone());
							let complete = chunk.is_complete;
							yield Ok(chunk);
							if complete {
								return;
							}
						},
						Ok(Some(Err(error))) => {
							gate.record_failure(&provider.name, latency_ms, &error.to_string());
							if error.is_credentials() {
								yield Err(error);
								return;
							}
							tracing::warn!(
								provider = %provider.name,
								operation = op.name(),
								%error,
								"stream chunk failed, switching provider"
							);
							last_error = Some(error.to_string());
							attempted.push(provider.name.clone());
							continue 'providers;
						},
						// Stream drained without an explicit final chunk.
						Ok(None) => return,
						Err(_) => {
							let message = format!(
								"chunk timed out after {}ms",
								operation_timeout.as_millis()
							);
							gate.record_failure(&provider.name, latency_ms, &message);
							last_error = Some(message);
							attempted.push(provider.name.clone());
							continue 'providers;
						},
					}
				}
			}
		})
	}

	/// True when at least one callable provider for `source` answers its
	/// liveness probe.
	pub async fn has_healthy_provider(&self, source: &str) -> bool {
		for provider in self.candidates(source, None, None) {
			if !self.gate.allow(&provider.name) {
				continue;
			}
			if provider.adapter.is_healthy().await.unwrap_or(false) {
				return true;
			}
		}
		false
	}

	/// Union of transaction kinds streamable for `source`, in canonical
	/// stream order.
	pub fn supported_transaction_kinds(&self, source: &str) -> Vec<TransactionKind> {
		let candidates = self.candidates(source, None, None);
		TransactionKind::ALL
			.iter()
			.copied()
			.filter(|kind| {
				candidates.iter().any(|p| {
					p.adapter.capabilities().supported_transaction_kinds.contains(kind)
				})
			})
			.collect()
	}

	/// Delegate replay-window application to the best adapter for `source`.
	pub fn apply_replay_window(&self, source: &str, cursor: &Cursor) -> Cursor {
		match self.candidates(source, None, None).first() {
			Some(provider) => provider.adapter.apply_replay_window(cursor),
			None => cursor.clone(),
		}
	}

	#[cfg(test)]
	pub(crate) fn invalidate_cache(&self) {
		self.cache.clear();
	}
}
