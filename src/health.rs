//! Liveness endpoint for the engine, so supervisors and dashboards can see
//! it is up. Answers HTTP 200 to any request on {hostname}:{port}/health.

use anyhow::Context;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpListener,
};

use crate::settings;

pub struct HealthChecker {
	listener: TcpListener,
}

// Split into new and run so callers can ensure the listener is bound before
// proceeding (important in tests).
impl HealthChecker {
	pub async fn new(health_check: &settings::HealthCheck) -> anyhow::Result<Self> {
		let bind_address = format!("{}:{}", health_check.hostname, health_check.port);
		tracing::info!(%bind_address, "starting health checker");
		Ok(Self {
			listener: TcpListener::bind(&bind_address)
				.await
				.with_context(|| format!("Could not bind TCP listener to {bind_address}"))?,
		})
	}

	pub async fn run(self) -> anyhow::Result<()> {
		loop {
			match self.listener.accept().await {
				Ok((mut stream, _address)) => {
					let mut buffer = [0; 1024];
					stream
						.read(&mut buffer)
						.await
						.context("Couldn't read stream into buffer")?;

					let mut headers = [httparse::EMPTY_HEADER; 16];
					let mut request = httparse::Request::new(&mut headers);
					match request.parse(&buffer) {
						Ok(_) => {
							if request.path == Some("/health") {
								stream
									.write_all(b"HTTP/1.1 200 OK\r\n\r\n")
									.await
									.context("Could not write to health check stream")?;
								stream
									.flush()
									.await
									.context("Could not flush health check TCP stream")?;
							} else {
								tracing::warn!(path = ?request.path, "health request at invalid path");
							}
						},
						Err(error) => {
							tracing::warn!(%error, "could not parse health check request");
						},
					}
				},
				Err(error) => {
					tracing::error!(%error, "could not open health check TCP stream");
				},
			}
		}
	}
}
