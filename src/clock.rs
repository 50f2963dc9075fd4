use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    NetworkTime,
}

#[async_trait]
pub trait Clock: Send {
    /// Monotonic milliseconds, only meaningful as differences.
    fn now_ms(&self) -> u64;

    async fn resync(&mut self, source: TimeSource) -> Result<(), anyhow::Error>;
}

/// Pacing delays, injected so tests can run the loop without real time passing.
#[async_trait]
pub trait Delay: Send {
    async fn sleep(&mut self, duration: Duration);
}

pub struct SystemClock {
    started: Instant,
    last_resync: Option<DateTime<Utc>>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_resync: None,
        }
    }

    pub fn last_resync(&self) -> Option<DateTime<Utc>> {
        self.last_resync
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    // The host keeps wall time via its own NTP client; record when we last
    // asked so drift shows up in the logs.
    async fn resync(&mut self, source: TimeSource) -> Result<(), anyhow::Error> {
        let now = Utc::now();
        if let Some(prev) = self.last_resync {
            info!(?source, since_last_secs = (now - prev).num_seconds(), "clock resynced");
        } else {
            info!(?source, utc = %now.to_rfc3339(), "clock synced");
        }
        self.last_resync = Some(now);
        Ok(())
    }
}

pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn sleep(&mut self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let mut delay = TokioDelay;
        let a = clock.now_ms();
        delay.sleep(Duration::from_millis(20)).await;
        let b = clock.now_ms();
        assert!(b >= a + 20);
    }

    #[tokio::test]
    async fn test_resync_records_time() {
        let mut clock = SystemClock::new();
        assert!(clock.last_resync().is_none());
        clock.resync(TimeSource::NetworkTime).await.unwrap();
        assert!(clock.last_resync().is_some());
    }
}
