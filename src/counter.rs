//! Pulse counter source.
//!
//! The meters' S0 outputs are wired to DS2423 dual counters on a 1-Wire bus.
//! On Linux the `w1_ds2423` driver exposes each chip under
//! `/sys/bus/w1/devices/<family>-<serial>/w1_slave`, one line per counter
//! page ending in `crc=YES c=<count>`. Only the last two pages carry the
//! externally wired counters A and B.

use crate::error::BusError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// One of the two externally wired counters on a DS2423.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterId {
    A,
    B,
}

impl CounterId {
    /// Line of the driver's `w1_slave` output holding this counter.
    fn line(self) -> usize {
        match self {
            CounterId::A => 2,
            CounterId::B => 3,
        }
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterId::A => write!(f, "A"),
            CounterId::B => write!(f, "B"),
        }
    }
}

#[async_trait]
pub trait CounterSource: Send {
    /// Number of counter devices currently present on the bus.
    async fn scan(&mut self) -> Result<usize, BusError>;

    async fn read(&mut self, address: &str, counter: CounterId) -> Result<u64, BusError>;
}

/// DS2423 counters through the Linux 1-Wire sysfs interface.
pub struct W1Counters {
    root: PathBuf,
    family: String,
}

impl W1Counters {
    pub fn new(root: impl Into<PathBuf>, family: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            family: family.into(),
        }
    }
}

#[async_trait]
impl CounterSource for W1Counters {
    async fn scan(&mut self) -> Result<usize, BusError> {
        let prefix = format!("{}-", self.family);
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|source| BusError::Io {
                path: self.root.display().to_string(),
                source,
            })?;

        let mut found = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|source| BusError::Io {
            path: self.root.display().to_string(),
            source,
        })? {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                found += 1;
            }
        }
        debug!(root = %self.root.display(), found, "scanned 1-wire bus");
        Ok(found)
    }

    async fn read(&mut self, address: &str, counter: CounterId) -> Result<u64, BusError> {
        let path = self.root.join(address).join("w1_slave");
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| BusError::Io {
                path: path.display().to_string(),
                source,
            })?;
        parse_counter(&raw, address, counter)
    }
}

/// Extract one counter from the driver's `w1_slave` text.
pub fn parse_counter(raw: &str, address: &str, counter: CounterId) -> Result<u64, BusError> {
    let line = raw
        .lines()
        .nth(counter.line())
        .ok_or_else(|| BusError::MissingCounter {
            address: address.to_string(),
            counter: counter.to_string(),
        })?;

    if !line.contains("crc=YES") {
        return Err(BusError::Crc {
            address: address.to_string(),
            counter: counter.to_string(),
        });
    }

    let value = line
        .rsplit_once("c=")
        .map(|(_, v)| v.trim())
        .ok_or_else(|| BusError::MissingCounter {
            address: address.to_string(),
            counter: counter.to_string(),
        })?;

    value.parse().map_err(|_| BusError::Parse {
        address: address.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
00 02 00 00 00 00 00 00 00 6d 38 00 ff ff 6d 38 crc=YES c=0
00 02 00 00 00 00 00 00 00 6d 38 00 ff ff 6d 38 crc=YES c=0
5f 55 5b 02 00 00 00 00 00 a1 4c 00 ff ff a1 4c crc=YES c=39540831
65 00 00 00 00 00 00 00 00 c2 8d 00 ff ff c2 8d crc=YES c=101
";

    #[test]
    fn test_parse_counter_a_and_b() {
        assert_eq!(parse_counter(SAMPLE, "1d-x", CounterId::A).unwrap(), 39_540_831);
        assert_eq!(parse_counter(SAMPLE, "1d-x", CounterId::B).unwrap(), 101);
    }

    #[test]
    fn test_parse_counter_crc_failure() {
        let bad = SAMPLE.replace("crc=YES c=101", "crc=NO c=101");
        let err = parse_counter(&bad, "1d-x", CounterId::B).unwrap_err();
        assert!(matches!(err, BusError::Crc { .. }));
    }

    #[test]
    fn test_parse_counter_truncated_output() {
        let short: String = SAMPLE.lines().take(2).collect::<Vec<_>>().join("\n");
        let err = parse_counter(&short, "1d-x", CounterId::A).unwrap_err();
        assert!(matches!(err, BusError::MissingCounter { .. }));
    }

    #[test]
    fn test_parse_counter_garbage_value() {
        let bad = SAMPLE.replace("c=101", "c=lots");
        let err = parse_counter(&bad, "1d-x", CounterId::B).unwrap_err();
        assert!(matches!(err, BusError::Parse { .. }));
    }

    #[test]
    fn test_w1_scan_and_read() {
        let root = std::env::temp_dir().join(format!("upower-w1-{}", std::process::id()));
        let chip = root.join("1d-00000cec6c94");
        std::fs::create_dir_all(&chip).unwrap();
        std::fs::create_dir_all(root.join("28-000005e2fdc3")).unwrap();
        std::fs::create_dir_all(root.join("w1_bus_master1")).unwrap();
        std::fs::write(chip.join("w1_slave"), SAMPLE).unwrap();

        let mut bus = W1Counters::new(&root, "1d");
        assert_eq!(tokio_test::block_on(bus.scan()).unwrap(), 1);
        assert_eq!(
            tokio_test::block_on(bus.read("1d-00000cec6c94", CounterId::A)).unwrap(),
            39_540_831
        );
        assert!(tokio_test::block_on(bus.read("1d-missing", CounterId::A)).is_err());

        std::fs::remove_dir_all(&root).ok();
    }
}
