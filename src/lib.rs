//! Multi-device proof-of-work round miner
//!
//! Fetches a header hash and target from a JSON-RPC node, races every
//! configured device on the same problem, keeps the first qualifying nonce,
//! stops the other devices, waits for all of them, submits, and repeats.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod table;
pub mod types;
pub mod utils;
pub mod work_source;
pub mod worker;

pub use config::Config;
pub use coordinator::{CoordinatorConfig, MinerStats, RoundCoordinator, RoundState};
pub use error::{Error, Result};
pub use table::{VerificationTable, TABLE_SIZE};
pub use types::*;
pub use work_source::WorkSource;
pub use worker::{DeviceWorker, WorkerReport};

/// Application information
pub const APP_NAME: &str = "pow-race-miner";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
