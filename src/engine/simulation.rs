//! Simulation engine for testing and development
//!
//! Runs on the CPU without any device. Each nonce is mixed with the header hash
//! and one word of the verification table through Blake2s, so results are
//! deterministic and depend on every input the real kernel consumes. The
//! output only fills the low 64 bits, which keeps any `u64` target reachable.

use super::{BatchOutcome, EngineFactory, SearchEngine};
use crate::table::VerificationTable;
use crate::{DeviceId, Hash, Nonce, Result, Target, HASH_LENGTH};
use blake2::{Blake2s256, Digest};
use tracing::{debug, info};

/// Factory producing one [`SimulationEngine`] per device id
#[derive(Debug, Default, Clone)]
pub struct SimulationFactory;

impl SimulationFactory {
    pub fn new() -> Self {
        Self
    }
}

impl EngineFactory for SimulationFactory {
    fn kind(&self) -> &'static str {
        "simulation"
    }

    fn initialize(
        &self,
        device: DeviceId,
        table: &VerificationTable,
    ) -> Result<Box<dyn SearchEngine>> {
        info!(device, "Initialized simulated device");
        Ok(Box::new(SimulationEngine::new(device, table.clone())))
    }
}

/// CPU stand-in for a device
pub struct SimulationEngine {
    name: String,
    table: VerificationTable,
}

impl SimulationEngine {
    pub fn new(device: DeviceId, table: VerificationTable) -> Self {
        Self {
            name: format!("simulated device {}", device),
            table,
        }
    }

    /// Search output for a single nonce
    pub fn output(&self, header: &Hash, nonce: Nonce) -> Hash {
        let mut hasher = Blake2s256::new();
        hasher.update(header.as_bytes());
        hasher.update(self.table.word(nonce.value()).to_le_bytes());
        hasher.update(nonce.value().to_le_bytes());
        let digest = hasher.finalize();

        let mut output = [0u8; HASH_LENGTH];
        output[HASH_LENGTH - 8..].copy_from_slice(&digest[..8]);
        Hash::new(output)
    }
}

impl SearchEngine for SimulationEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn search_batch(
        &mut self,
        header: &Hash,
        target: Target,
        start: Nonce,
        count: u64,
    ) -> Result<BatchOutcome> {
        for offset in 0..count {
            let nonce = start.advanced(offset);
            let output = self.output(header, nonce);
            if target.is_met_by(&output) {
                debug!(nonce = %nonce, "Simulated device produced a candidate");
                return Ok(BatchOutcome::hit(offset + 1, nonce, output));
            }
        }
        Ok(BatchOutcome::miss(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TABLE_SIZE;

    fn engine() -> SimulationEngine {
        let table = VerificationTable::from_bytes(vec![0x5Au8; TABLE_SIZE]).unwrap();
        SimulationEngine::new(0, table)
    }

    #[test]
    fn test_easiest_target_hits_first_nonce() {
        let mut engine = engine();
        let header = Hash::from_slice(&[1, 2, 3]);
        let outcome = engine
            .search_batch(&header, Target::max(), Nonce::new(500), 64)
            .unwrap();

        assert_eq!(outcome.attempted, 1);
        let candidate = outcome.candidate.unwrap();
        assert_eq!(candidate.nonce, Nonce::new(500));
        assert!(Target::max().is_met_by(&candidate.output));
    }

    #[test]
    fn test_hardest_target_exhausts_batch() {
        let mut engine = engine();
        let outcome = engine
            .search_batch(&Hash::default(), Target::min(), Nonce::new(0), 128)
            .unwrap();

        assert_eq!(outcome.attempted, 128);
        assert!(outcome.candidate.is_none());
    }

    #[test]
    fn test_output_is_deterministic() {
        let engine = engine();
        let header = Hash::from_slice(&[9; 32]);
        assert_eq!(
            engine.output(&header, Nonce::new(77)),
            engine.output(&header, Nonce::new(77))
        );
        assert_ne!(
            engine.output(&header, Nonce::new(77)),
            engine.output(&header, Nonce::new(78))
        );
    }

    #[test]
    fn test_candidate_meets_target() {
        let mut engine = engine();
        let target = Target::new(u64::MAX >> 4);
        let outcome = engine
            .search_batch(&Hash::default(), target, Nonce::new(0), 10_000)
            .unwrap();

        let candidate = outcome.candidate.expect("1 in 16 odds over 10k nonces");
        assert!(target.is_met_by(&candidate.output));
        assert_eq!(candidate.nonce.value() + 1, outcome.attempted);
    }

    #[test]
    fn test_factory_names_device() {
        let table = VerificationTable::from_bytes(vec![0u8; TABLE_SIZE]).unwrap();
        let engine = SimulationFactory::new().initialize(3, &table).unwrap();
        assert_eq!(engine.name(), "simulated device 3");
    }
}
