//! Device workers
//!
//! A [`DeviceWorker`] owns one initialized engine and a private nonce cursor.
//! The coordinator hands it a problem and a round cancellation token; the
//! worker searches in bounded steps until it finds a qualifying nonce, the
//! token fires, or the device fails, and then reports exactly once.

use crate::engine::{EngineFactory, SearchEngine};
use crate::table::VerificationTable;
use crate::{DeviceId, Error, Nonce, Problem, Result, SearchResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Span};

/// Default nonces per search step
pub const DEFAULT_BATCH_SIZE: u64 = 64;

/// What a worker hands back to the coordinator at the end of a search
#[derive(Debug)]
pub struct WorkerReport {
    pub device: DeviceId,
    pub result: SearchResult,
    /// Set when the device failed; `result` then holds the work done before it
    pub error: Option<Error>,
}

impl WorkerReport {
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Search worker bound to one device
pub struct DeviceWorker {
    device: DeviceId,
    engine: Box<dyn SearchEngine>,
    next_nonce: Nonce,
    batch_size: u64,
}

impl DeviceWorker {
    /// Create a worker whose nonce cursor starts at a random seed
    pub fn new(device: DeviceId, engine: Box<dyn SearchEngine>, batch_size: u64) -> Self {
        Self::with_seed(device, engine, batch_size, Nonce::new(rand::random()))
    }

    /// Create a worker with a known starting nonce
    pub fn with_seed(
        device: DeviceId,
        engine: Box<dyn SearchEngine>,
        batch_size: u64,
        seed: Nonce,
    ) -> Self {
        Self {
            device,
            engine,
            next_nonce: seed,
            batch_size: batch_size.max(1),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// First nonce the next search step will try
    pub fn next_nonce(&self) -> Nonce {
        self.next_nonce
    }

    /// Search `problem` until a solution, cancellation or a device error
    ///
    /// Cancellation is checked before every step, so a cancelled worker returns
    /// after at most one more step. The nonce cursor keeps advancing across
    /// searches and is never reset between rounds.
    pub fn search(&mut self, problem: &Problem, cancel: &CancellationToken) -> WorkerReport {
        let span = device_span(self.device);
        let _enter = span.enter();

        debug!(start = %self.next_nonce, target = %problem.target, "Starting search");
        let mut attempted = 0u64;

        loop {
            if cancel.is_cancelled() {
                debug!(attempted, "Search cancelled");
                return self.report(SearchResult::exhausted(attempted), None);
            }

            let start = self.next_nonce;
            let batch = match self.engine.search_batch(
                &problem.header_hash,
                problem.target,
                start,
                self.batch_size,
            ) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(attempted, "Device failed during search: {}", e);
                    return self.report(SearchResult::exhausted(attempted), Some(e));
                }
            };

            self.next_nonce.advance(self.batch_size);
            attempted = attempted.saturating_add(batch.attempted);

            if let Some(candidate) = batch.candidate {
                if problem.target.is_met_by(&candidate.output) {
                    info!(nonce = %candidate.nonce, attempted, "Found qualifying nonce");
                    return self.report(SearchResult::solved(attempted, candidate.nonce), None);
                }
                trace!(nonce = %candidate.nonce, "Discarding candidate above target");
            }
        }
    }

    fn report(&self, result: SearchResult, error: Option<Error>) -> WorkerReport {
        WorkerReport {
            device: self.device,
            result,
            error,
        }
    }
}

impl std::fmt::Debug for DeviceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceWorker")
            .field("device", &self.device)
            .field("engine", &self.engine.name())
            .field("next_nonce", &self.next_nonce)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

/// Initialize one worker per device, skipping devices that fail
///
/// Fails with [`Error::NoDevices`] when no device could be initialized.
pub fn initialize_workers(
    factory: &dyn EngineFactory,
    devices: &[DeviceId],
    table: &VerificationTable,
    batch_size: u64,
) -> Result<Vec<DeviceWorker>> {
    let mut workers = Vec::with_capacity(devices.len());
    for &device in devices {
        match factory.initialize(device, table) {
            Ok(engine) => {
                info!(device, engine = engine.name(), "Device ready");
                workers.push(DeviceWorker::new(device, engine, batch_size));
            }
            Err(e) => warn!(device, "Excluding device: {}", e),
        }
    }

    if workers.is_empty() {
        return Err(Error::no_devices(format!(
            "none of the {} configured {} devices initialized",
            devices.len(),
            factory.kind()
        )));
    }
    Ok(workers)
}

/// Create a tracing span for one device's search
pub fn device_span(device: DeviceId) -> Span {
    tracing::info_span!("device", device = device)
}
