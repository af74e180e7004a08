//! Work sources
//!
//! The coordinator fetches problems from, and submits solutions to, a
//! [`WorkSource`]. The production implementation talks JSON-RPC to a node;
//! tests substitute scripted sources.

use crate::{Nonce, Problem, Result};
use async_trait::async_trait;

pub mod rpc;

pub use rpc::{RpcConfig, RpcWorkSource};

/// Remote service handing out problems and accepting solutions
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Name for logging
    fn name(&self) -> &str;

    /// Fetch the current problem
    async fn fetch_problem(&self) -> Result<Problem>;

    /// Submit a winning nonce for a previously fetched problem
    async fn submit_solution(&self, problem: &Problem, nonce: Nonce) -> Result<()>;
}
