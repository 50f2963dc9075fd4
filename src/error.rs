use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Failures talking to the 1-Wire counter bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("counter {counter} on {address} not present in device output")]
    MissingCounter { address: String, counter: String },
    #[error("CRC check failed reading counter {counter} on {address}")]
    Crc { address: String, counter: String },
    #[error("unparseable counter value {value:?} on {address}")]
    Parse { address: String, value: String },
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network unreachable after {attempts} attempt(s): {reason}")]
    Unreachable { attempts: u32, reason: String },
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("broker did not acknowledge the connection within {0}s")]
    ConnectTimeout(u64),
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("discovery payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors surfaced by the connectivity supervisor to the control loop.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("publish failed after reconnect: {0}")]
    RetryExhausted(BrokerError),
}

impl BrokerError {
    /// Transport errors are the only ones worth a reconnect-and-retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }
}

/// A single cycle that could not complete. Never terminal on its own.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("sampling failed: {0}")]
    Sample(#[from] BusError),
    #[error("publish failed: {0}")]
    Publish(#[from] ConnectivityError),
}
