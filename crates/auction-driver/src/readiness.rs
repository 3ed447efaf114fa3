//! Server readiness checks.
//!
//! Decides when clients may be launched after the server has been spawned:
//! a fixed grace sleep, a TCP poll of every scenario port, or a poll of the
//! server's stdout log for a marker line.

use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::error::{DriverError, DriverResult};
use crate::process::ServerHandle;
use crate::scenario::PortTable;

/// Readiness strategy, tagged by `kind` in the JSON config
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Readiness {
    /// Sleep a fixed time and assume the server is up
    Grace { millis: u64 },
    /// Wait until every scenario port accepts a TCP connection. Each poll
    /// opens and drops a real connection to the server under test, so only
    /// use it with servers that tolerate throwaway connections.
    Ports { timeout_ms: u64, poll_ms: u64 },
    /// Wait until the server's stdout log contains `marker`
    LogLine {
        marker: String,
        timeout_ms: u64,
        poll_ms: u64,
    },
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::Grace { millis: 1_000 }
    }
}

impl Readiness {
    /// Block until the server is considered ready
    pub async fn wait(
        &self,
        server: &mut ServerHandle,
        host: &str,
        ports: &PortTable,
    ) -> DriverResult<()> {
        match self {
            Readiness::Grace { millis } => {
                tracing::debug!(millis, "Waiting fixed grace period for server");
                tokio::time::sleep(Duration::from_millis(*millis)).await;
                Ok(())
            }
            Readiness::Ports {
                timeout_ms,
                poll_ms,
            } => {
                let ports = parse_ports(ports)?;
                let deadline = Deadline::new(*timeout_ms);
                let mut pending = ports;
                loop {
                    pending = probe_closed(host, pending).await;
                    if pending.is_empty() {
                        tracing::info!(elapsed = ?deadline.elapsed(), "Server ports accepting connections");
                        return Ok(());
                    }
                    check_alive(server)?;
                    deadline.check(|| format!("ports {:?} not accepting connections", pending))?;
                    tokio::time::sleep(Duration::from_millis(*poll_ms)).await;
                }
            }
            Readiness::LogLine {
                marker,
                timeout_ms,
                poll_ms,
            } => {
                let deadline = Deadline::new(*timeout_ms);
                let log = server.logs().stdout.clone();
                loop {
                    // The file exists from spawn; a read error is fatal
                    let text = tokio::fs::read_to_string(&log).await?;
                    if text.lines().any(|line| line.contains(marker.as_str())) {
                        tracing::info!(elapsed = ?deadline.elapsed(), marker = %marker, "Server reported ready");
                        return Ok(());
                    }
                    check_alive(server)?;
                    deadline.check(|| format!("marker '{}' not seen in {}", marker, log.display()))?;
                    tokio::time::sleep(Duration::from_millis(*poll_ms)).await;
                }
            }
        }
    }
}

struct Deadline {
    start: Instant,
    limit: Duration,
}

impl Deadline {
    fn new(timeout_ms: u64) -> Self {
        Self {
            start: Instant::now(),
            limit: Duration::from_millis(timeout_ms),
        }
    }

    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn check(&self, what: impl FnOnce() -> String) -> DriverResult<()> {
        if self.start.elapsed() >= self.limit {
            return Err(DriverError::ServerNotReady(format!(
                "{} after {:?}",
                what(),
                self.limit
            )));
        }
        Ok(())
    }
}

fn parse_ports(ports: &PortTable) -> DriverResult<Vec<u16>> {
    ports
        .distinct_ports()
        .into_iter()
        .map(|p| {
            p.parse::<u16>()
                .map_err(|_| DriverError::Config(format!("port '{}' is not a TCP port", p)))
        })
        .collect()
}

/// Returns the ports that still refuse connections
async fn probe_closed(host: &str, ports: Vec<u16>) -> Vec<u16> {
    let mut closed = Vec::new();
    for port in ports {
        if tokio::net::TcpStream::connect((host, port)).await.is_err() {
            closed.push(port);
        }
    }
    closed
}

fn check_alive(server: &mut ServerHandle) -> DriverResult<()> {
    if let Some(status) = server.try_exited()? {
        return Err(DriverError::ServerNotReady(format!(
            "server exited early with {}",
            status
        )));
    }
    Ok(())
}
