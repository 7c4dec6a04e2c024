use std::time::Duration;

// ======= Provider manager =======

/// How long a cached provider response stays servable.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Per-operation timeout applied to every provider call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

// ======= Circuit breaker =======

/// Consecutive failures before a provider's circuit opens.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Time a provider's circuit stays open before a half-open trial.
pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

/// Number of recent calls kept for failure-rate and latency averaging.
pub const HEALTH_WINDOW_SIZE: usize = 50;

// ======= Rate limiting =======

/// Default steady-state requests per second per provider.
pub const DEFAULT_RATE_LIMIT_PER_SEC: f64 = 5.0;

/// Default token-bucket burst capacity per provider.
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 5;

// ======= Replay windows =======

/// Blocks re-fetched on resume for EVM-style chains, to absorb reorgs.
pub const DEFAULT_EVM_REPLAY_BLOCKS: u64 = 12;

/// Seconds re-fetched on resume for exchange ledgers, to absorb late writes.
pub const DEFAULT_EXCHANGE_REPLAY_SECONDS: u64 = 900;

// ======= HD gap scan =======

/// Consecutive unused addresses before forward derivation stops.
pub const DEFAULT_GAP_LIMIT: u32 = 10;

/// Hard ceiling on derived addresses per scheme, against runaway scans.
pub const MAX_DERIVED_ADDRESSES: u32 = 2000;

// ======= Cursors =======

/// `last_transaction_id` sentinel marking a stream whose fetch failed.
pub const FETCH_FAILED_SENTINEL: &str = "FETCH_FAILED";

// ======= Settings environment variables =======

pub const ENV_PREFIX: &str = "TIDEBOOK";
pub const ENV_SEPARATOR: &str = "__";
