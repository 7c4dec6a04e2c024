//! Layered engine configuration: built-in defaults, an optional TOML file,
//! then `TIDEBOOK__`-prefixed environment variables (`__` separated, e.g.
//! `TIDEBOOK__BREAKER__COOLDOWN_SECS=30`).

use std::{collections::HashMap, path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::{
	constants::{
		DEFAULT_BREAKER_COOLDOWN, DEFAULT_CACHE_TTL, DEFAULT_EVM_REPLAY_BLOCKS,
		DEFAULT_EXCHANGE_REPLAY_SECONDS, DEFAULT_GAP_LIMIT, DEFAULT_MAX_CONSECUTIVE_FAILURES,
		DEFAULT_OPERATION_TIMEOUT, ENV_PREFIX, ENV_SEPARATOR, MAX_DERIVED_ADDRESSES,
	},
	gate::BreakerConfig,
	provider::{ProviderManagerConfig, ProviderRegistration, RateLimitSpec},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
	pub path: String,
}

impl Default for DatabaseSettings {
	fn default() -> Self {
		Self { path: "tidebook.db".to_string() }
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheck {
	pub hostname: String,
	pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderManagerSettings {
	pub cache_ttl_secs: u64,
	pub operation_timeout_secs: u64,
}

impl Default for ProviderManagerSettings {
	fn default() -> Self {
		Self {
			cache_ttl_secs: DEFAULT_CACHE_TTL.as_secs(),
			operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT.as_secs(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
	pub max_consecutive_failures: u32,
	pub cooldown_secs: u64,
}

impl Default for BreakerSettings {
	fn default() -> Self {
		Self {
			max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
			cooldown_secs: DEFAULT_BREAKER_COOLDOWN.as_secs(),
		}
	}
}

/// Replay overlaps are per source family; exact sizes are deployment policy,
/// not engine constants.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
	pub evm_blocks: u64,
	pub exchange_seconds: u64,
}

impl Default for ReplaySettings {
	fn default() -> Self {
		Self {
			evm_blocks: DEFAULT_EVM_REPLAY_BLOCKS,
			exchange_seconds: DEFAULT_EXCHANGE_REPLAY_SECONDS,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GapScanSettings {
	pub gap_limit: u32,
	pub max_addresses: u32,
}

impl Default for GapScanSettings {
	fn default() -> Self {
		Self { gap_limit: DEFAULT_GAP_LIMIT, max_addresses: MAX_DERIVED_ADDRESSES }
	}
}

/// Per-provider overrides keyed by provider name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderOverride {
	pub priority: Option<u32>,
	pub enabled: Option<bool>,
	pub requests_per_sec: Option<f64>,
	pub burst: Option<u32>,
	pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
	pub database: DatabaseSettings,
	pub health_check: Option<HealthCheck>,
	pub provider_manager: ProviderManagerSettings,
	pub breaker: BreakerSettings,
	pub replay: ReplaySettings,
	pub gap_scan: GapScanSettings,
	pub providers: HashMap<String, ProviderOverride>,
}

impl Settings {
	/// Load defaults, then the optional file, then the environment.
	pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
		let mut builder = Config::builder();
		if let Some(path) = config_file {
			builder = builder.add_source(File::from(path));
		}
		builder
			.add_source(
				Environment::with_prefix(ENV_PREFIX)
					.prefix_separator(ENV_SEPARATOR)
					.separator(ENV_SEPARATOR)
					.try_parsing(true),
			)
			.build()?
			.try_deserialize()
	}

	pub fn breaker_config(&self) -> BreakerConfig {
		BreakerConfig {
			max_consecutive_failures: self.breaker.max_consecutive_failures,
			cooldown: Duration::from_secs(self.breaker.cooldown_secs),
		}
	}

	pub fn provider_manager_config(&self) -> ProviderManagerConfig {
		ProviderManagerConfig {
			cache_ttl: Duration::from_secs(self.provider_manager.cache_ttl_secs),
			operation_timeout: Duration::from_secs(self.provider_manager.operation_timeout_secs),
		}
	}

	/// Registration knobs for one provider, falling back to the given
	/// priority when no override exists.
	pub fn registration_for(&self, provider: &str, default_priority: u32) -> ProviderRegistration {
		let overrides = self.providers.get(provider);
		ProviderRegistration {
			priority: overrides.and_then(|o| o.priority).unwrap_or(default_priority),
			enabled: overrides.and_then(|o| o.enabled).unwrap_or(true),
			rate_limit_override: overrides.and_then(|o| {
				o.requests_per_sec.map(|requests_per_sec| RateLimitSpec {
					requests_per_sec,
					burst: o.burst.unwrap_or(crate::constants::DEFAULT_RATE_LIMIT_BURST),
				})
			}),
		}
	}

	pub fn api_key_for(&self, provider: &str) -> Option<String> {
		self.providers.get(provider).and_then(|o| o.api_key.clone())
	}
}
