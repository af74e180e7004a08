//! Device search engines
//!
//! An engine is the narrow capability a device exposes to the miner: given a
//! header hash, a target and a nonce range, try the range and report how many
//! nonces were attempted plus the device's best candidate. Engines never decide
//! whether a candidate wins; the device worker checks it against the target.

use crate::config::EngineKind;
use crate::table::VerificationTable;
use crate::{DeviceId, Error, Hash, Nonce, Result, Target};
use std::path::Path;

#[cfg(feature = "opencl")]
pub mod opencl;
pub mod simulation;

#[cfg(feature = "opencl")]
pub use opencl::OpenClFactory;
pub use simulation::{SimulationEngine, SimulationFactory};

/// A candidate solution reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub nonce: Nonce,
    /// Search output for `nonce`, compared big-endian against the target
    pub output: Hash,
}

/// Result of one bounded search step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    /// Nonces actually attempted in this step
    pub attempted: u64,
    pub candidate: Option<Candidate>,
}

impl BatchOutcome {
    /// A step that tried `attempted` nonces without a candidate
    pub fn miss(attempted: u64) -> Self {
        Self {
            attempted,
            candidate: None,
        }
    }

    /// A step that produced a candidate after `attempted` nonces
    pub fn hit(attempted: u64, nonce: Nonce, output: Hash) -> Self {
        Self {
            attempted,
            candidate: Some(Candidate { nonce, output }),
        }
    }
}

/// One initialized device
///
/// `search_batch` must return after trying at most `count` nonces starting at
/// `start`; the worker relies on this to observe cancellation promptly.
pub trait SearchEngine: Send {
    /// Human readable device description for logs
    fn name(&self) -> &str;

    /// Search `count` consecutive nonces starting at `start`
    fn search_batch(
        &mut self,
        header: &Hash,
        target: Target,
        start: Nonce,
        count: u64,
    ) -> Result<BatchOutcome>;
}

/// Creates engines for device handles
///
/// Initialization failures are reported per device so the caller can exclude
/// that device and continue with the rest.
pub trait EngineFactory: Send + Sync {
    /// Engine kind name for logs
    fn kind(&self) -> &'static str;

    /// Initialize the device and upload the verification table to it
    fn initialize(
        &self,
        device: DeviceId,
        table: &VerificationTable,
    ) -> Result<Box<dyn SearchEngine>>;
}

/// Build the engine factory selected in the configuration
pub fn factory_for(kind: EngineKind, kernel_path: Option<&Path>) -> Result<Box<dyn EngineFactory>> {
    match kind {
        EngineKind::Simulation => Ok(Box::new(SimulationFactory::new())),
        EngineKind::Opencl => opencl_factory(kernel_path),
    }
}

#[cfg(feature = "opencl")]
fn opencl_factory(kernel_path: Option<&Path>) -> Result<Box<dyn EngineFactory>> {
    let path = kernel_path
        .ok_or_else(|| Error::config("The OpenCL engine requires --kernel-path"))?;
    Ok(Box::new(OpenClFactory::from_file(path)?))
}

#[cfg(not(feature = "opencl"))]
fn opencl_factory(_kernel_path: Option<&Path>) -> Result<Box<dyn EngineFactory>> {
    Err(Error::config(
        "This build has no OpenCL support; rebuild with `--features opencl` or use `--engine simulation`",
    ))
}
