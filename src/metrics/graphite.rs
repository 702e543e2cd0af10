use super::{MetricsRegistry, MetricsReporter};
use crate::config::types::MetricsConfig;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Graphite plaintext protocol: `{prefix}.{name} {value} {unix_ts}\n` over TCP.
///
/// Values accumulate in memory and are sent in one connection on `flush`.
#[derive(Debug)]
pub struct GraphiteReporter {
    address: String,
    prefix: String,
    registry: MetricsRegistry,
}

impl GraphiteReporter {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            address: format!("{}:{}", config.host, config.port),
            prefix: config.prefix.trim_matches('.').to_string(),
            registry: MetricsRegistry::new(),
        }
    }

    pub fn render(&self, timestamp: i64) -> String {
        let mut out = String::new();
        for (name, value) in self.registry.snapshot() {
            let path = if self.prefix.is_empty() {
                name
            } else {
                format!("{}.{}", self.prefix, name)
            };
            out.push_str(&format!("{} {} {}\n", path, value, timestamp));
        }
        out
    }

    async fn send(&self, payload: &str) -> std::io::Result<()> {
        let mut stream = TcpStream::connect(&self.address).await?;
        stream.write_all(payload.as_bytes()).await?;
        stream.shutdown().await
    }
}

#[async_trait]
impl MetricsReporter for GraphiteReporter {
    fn incr(&self, name: &str, value: u64) {
        self.registry.incr(name, value);
    }

    fn gauge(&self, name: &str, value: f64) {
        self.registry.set(name, value);
    }

    async fn flush(&self) {
        let payload = self.render(Utc::now().timestamp());
        if payload.is_empty() {
            return;
        }

        match tokio::time::timeout(SEND_TIMEOUT, self.send(&payload)).await {
            Ok(Ok(())) => {
                tracing::debug!(address = %self.address, lines = payload.lines().count(), "Sent metrics");
            }
            Ok(Err(e)) => {
                tracing::warn!(address = %self.address, error = %e, "Failed to send metrics");
            }
            Err(_) => {
                tracing::warn!(address = %self.address, "Timed out sending metrics");
            }
        }
    }
}
