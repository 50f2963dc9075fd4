pub mod clock;
pub mod config;
pub mod control;
pub mod counter;
pub mod discovery;
pub mod error;
pub mod mqtt;
pub mod net;
pub mod policy;
pub mod power;
pub mod restart;
pub mod status;
pub mod supervisor;

pub use config::Config;
pub use control::{Collaborators, ControlLoop, LoopState};
pub use error::{AppError, Result};
