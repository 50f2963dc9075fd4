use crate::config::NetworkConfig;
use crate::error::NetworkError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Network: Send {
    async fn is_connected(&mut self) -> bool;

    /// Block until the network is up; returns the local address in use.
    async fn connect(&mut self) -> Result<String, NetworkError>;
}

/// Liveness measured as reachability of the broker endpoint.
pub struct TcpProbe {
    target: String,
    probe_timeout: Duration,
    retry_interval: Duration,
    max_attempts: Option<u32>,
}

impl TcpProbe {
    pub fn new(host: &str, port: u16, cfg: &NetworkConfig) -> Self {
        Self {
            target: format!("{}:{}", host, port),
            probe_timeout: Duration::from_millis(cfg.probe_timeout_ms),
            retry_interval: Duration::from_millis(cfg.retry_interval_ms),
            max_attempts: cfg.max_attempts,
        }
    }

    async fn probe(&self) -> Result<String, String> {
        match timeout(self.probe_timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(stream)) => Ok(stream
                .local_addr()
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|_| "?".into())),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.probe_timeout)),
        }
    }
}

#[async_trait]
impl Network for TcpProbe {
    async fn is_connected(&mut self) -> bool {
        let up = self.probe().await.is_ok();
        debug!(endpoint = %self.target, up, "network probe");
        up
    }

    async fn connect(&mut self) -> Result<String, NetworkError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.probe().await {
                Ok(addr) => {
                    info!(endpoint = %self.target, local = %addr, attempts, "network up");
                    return Ok(addr);
                }
                Err(reason) => {
                    if self.max_attempts.is_some_and(|max| attempts >= max) {
                        return Err(NetworkError::Unreachable { attempts, reason });
                    }
                    warn!(endpoint = %self.target, attempts, %reason, "network down; retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }
}
