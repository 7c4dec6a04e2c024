use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Filter via `RUST_LOG`, e.g.
/// `RUST_LOG=tidebook_engine=debug`. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
	let _ = tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(EnvFilter::from_default_env())
		.try_init();
}

#[cfg(test)]
mod tests {
	#[test]
	fn init_twice_does_not_panic() {
		super::init();
		super::init();
	}
}
