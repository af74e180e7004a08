//! Round coordinator
//!
//! Drives the mining cycle: fetch a problem, race every device worker on it,
//! take the first qualifying nonce, cancel the rest, wait for every worker to
//! report (the barrier), submit, and start over. Rounds never overlap; a new
//! fetch only happens after every worker of the previous round has reported.
//!
//! Each round gets a fresh child of the shutdown token. Completion reports
//! arrive over a channel sized to the worker count, so a worker never blocks
//! when reporting, and each report carries the worker back for the next round.

use crate::utils::format_hash_rate;
use crate::work_source::WorkSource;
use crate::worker::{DeviceWorker, WorkerReport};
use crate::{DeviceId, Error, Hash, Problem, Result, RoundOutcome, Winner};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Phases of one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Fetching,
    Dispatching,
    AwaitingResult,
    Barrier,
    Submitting,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundState::Fetching => "fetching",
            RoundState::Dispatching => "dispatching",
            RoundState::AwaitingResult => "awaiting_result",
            RoundState::Barrier => "barrier",
            RoundState::Submitting => "submitting",
        };
        f.write_str(name)
    }
}

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Pause after a failed fetch, or a round without a solution, before fetching again
    pub fetch_retry_delay: Duration,
    /// Re-fetch interval while a round is running; `None` disables preemption
    pub stale_check_interval: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fetch_retry_delay: Duration::from_secs(1),
            stale_check_interval: None,
        }
    }
}

/// Totals across all rounds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MinerStats {
    pub rounds: u64,
    pub solutions: u64,
    pub submissions_accepted: u64,
    pub submissions_failed: u64,
    pub preempted_rounds: u64,
    pub fetch_failures: u64,
    pub worker_errors: u64,
    pub total_hashes: u64,
    #[serde(with = "duration_secs")]
    pub mining_time: Duration,
}

impl MinerStats {
    /// Fold a completed round into the totals
    pub fn record_round(&mut self, outcome: &RoundOutcome) {
        self.rounds += 1;
        self.total_hashes = self.total_hashes.saturating_add(outcome.total_hashes);
        self.worker_errors += outcome.failed_workers as u64;
        self.mining_time += outcome.elapsed;
        if outcome.winner.is_some() {
            self.solutions += 1;
        }
        if outcome.preempted {
            self.preempted_rounds += 1;
        }
    }

    /// Average hash rate over all mining time
    pub fn average_hash_rate(&self) -> f64 {
        let secs = self.mining_time.as_secs_f64();
        if secs > 0.0 {
            self.total_hashes as f64 / secs
        } else {
            0.0
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// A worker returning from a round together with its report
struct Completion {
    worker: DeviceWorker,
    report: WorkerReport,
}

/// Per-round aggregation; created fresh for every round
#[derive(Debug, Default)]
struct RoundTally {
    total_hashes: u64,
    winner: Option<Winner>,
    failed_workers: usize,
    reported: usize,
}

impl RoundTally {
    /// Record one report, returning true if it is the round's first winner
    fn record(&mut self, report: &WorkerReport) -> bool {
        self.reported += 1;
        self.total_hashes = self
            .total_hashes
            .saturating_add(report.result.hashes_attempted);
        if report.is_failure() {
            self.failed_workers += 1;
            return false;
        }
        match (self.winner, report.result.solution()) {
            (None, Some(nonce)) => {
                self.winner = Some(Winner {
                    device: report.device,
                    nonce,
                });
                true
            }
            _ => false,
        }
    }
}

/// Runs rounds against a work source with a pool of device workers
pub struct RoundCoordinator {
    source: Arc<dyn WorkSource>,
    workers: Vec<DeviceWorker>,
    config: CoordinatorConfig,
    stats: MinerStats,
    round: u64,
}

impl RoundCoordinator {
    /// Create a coordinator over an initialized worker pool
    pub fn new(
        source: Arc<dyn WorkSource>,
        workers: Vec<DeviceWorker>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            source,
            workers,
            config,
            stats: MinerStats::default(),
            round: 0,
        }
    }

    pub fn stats(&self) -> &MinerStats {
        &self.stats
    }

    /// Devices currently in the pool
    pub fn devices(&self) -> Vec<DeviceId> {
        self.workers.iter().map(DeviceWorker::device).collect()
    }

    /// Run rounds until `shutdown` fires
    ///
    /// Returns the final statistics. Only losing every worker is fatal.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<MinerStats> {
        info!(
            workers = self.workers.len(),
            source = self.source.name(),
            "Starting mining rounds"
        );

        while !shutdown.is_cancelled() {
            let Some(outcome) = self.run_round(&shutdown).await? else {
                break;
            };

            // No solution this round: back off before the next fetch.
            if outcome.winner.is_none() && !outcome.preempted && !shutdown.is_cancelled() {
                debug!(round = outcome.round, "Round ended without a solution, pausing");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.fetch_retry_delay) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }

        info!(
            rounds = self.stats.rounds,
            solutions = self.stats.solutions,
            accepted = self.stats.submissions_accepted,
            "Mining stopped"
        );
        Ok(self.stats.clone())
    }

    /// Run one full round
    ///
    /// Returns `None` if shutdown was requested before a problem was fetched.
    pub async fn run_round(&mut self, shutdown: &CancellationToken) -> Result<Option<RoundOutcome>> {
        let Some(problem) = self.fetch(shutdown).await else {
            return Ok(None);
        };

        self.round += 1;
        let span = info_span!("round", round = self.round);
        let outcome = self.race(problem, shutdown).instrument(span.clone()).await?;
        self.submit(&outcome).instrument(span).await;
        Ok(Some(outcome))
    }

    /// Fetch until a problem arrives; never dispatches on failure
    async fn fetch(&mut self, shutdown: &CancellationToken) -> Option<Problem> {
        loop {
            let result = tokio::select! {
                result = self.source.fetch_problem() => result,
                _ = shutdown.cancelled() => return None,
            };

            match result {
                Ok(problem) => {
                    debug!(state = %RoundState::Fetching, hash = %problem.header_hash, target = %problem.target, "Fetched problem");
                    return Some(problem);
                }
                Err(e) if e.is_retryable() => {
                    warn!(state = %RoundState::Fetching, category = e.category(), "Failed to fetch work: {}", e);
                }
                Err(e) => {
                    error!(state = %RoundState::Fetching, category = e.category(), "Discarding unusable work: {}", e);
                }
            }
            self.stats.fetch_failures += 1;

            tokio::select! {
                _ = tokio::time::sleep(self.config.fetch_retry_delay) => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Dispatch, await the winner, cancel and drain the barrier
    async fn race(&mut self, problem: Problem, shutdown: &CancellationToken) -> Result<RoundOutcome> {
        let started = Instant::now();
        let round_token = shutdown.child_token();
        let problem = Arc::new(problem);

        let workers = std::mem::take(&mut self.workers);
        let dispatched: Vec<DeviceId> = workers.iter().map(DeviceWorker::device).collect();
        debug!(state = %RoundState::Dispatching, workers = dispatched.len(), "Dispatching workers");

        let (tx, mut rx) = mpsc::channel::<Completion>(dispatched.len().max(1));
        for mut worker in workers {
            let tx = tx.clone();
            let problem = Arc::clone(&problem);
            let token = round_token.clone();
            tokio::task::spawn_blocking(move || {
                let report = worker.search(&problem, &token);
                // The receiver outlives every worker unless the round was abandoned.
                let _ = tx.blocking_send(Completion { worker, report });
            });
        }
        drop(tx);

        let mut tally = RoundTally::default();
        let mut preempted = false;
        let mut stale_timer = self.config.stale_check_interval.map(|period| {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        let mut stale_check: Option<JoinHandle<bool>> = None;

        while tally.reported < dispatched.len() {
            let completion = tokio::select! {
                completion = rx.recv() => completion,
                _ = tick(&mut stale_timer), if stale_check.is_none() && !round_token.is_cancelled() => {
                    stale_check = Some(tokio::spawn(work_changed(
                        Arc::clone(&self.source),
                        problem.header_hash,
                    )));
                    continue;
                }
                changed = stale_result(&mut stale_check), if stale_check.is_some() => {
                    stale_check = None;
                    if changed && !round_token.is_cancelled() {
                        info!(state = %RoundState::AwaitingResult, "Work changed upstream, cancelling round");
                        preempted = true;
                        round_token.cancel();
                    }
                    continue;
                }
            };

            let Some(Completion { worker, report }) = completion else {
                break;
            };

            if let Some(error) = &report.error {
                warn!(device = report.device, category = error.category(), "Worker failed: {}", error);
            }
            if tally.record(&report) && !round_token.is_cancelled() {
                info!(device = report.device, nonce = %report.result.nonce, "Round won, cancelling other workers");
                round_token.cancel();
            }
            self.workers.push(worker);
        }

        if let Some(check) = stale_check.take() {
            check.abort();
        }

        // A completion channel that closes early means a worker task died
        // without reporting; its device leaves the pool.
        if tally.reported < dispatched.len() {
            for device in dispatched.iter().filter(|d| !self.workers.iter().any(|w| w.device() == **d)) {
                let lost = Error::worker_lost(*device, "search task ended without reporting");
                error!(device = *device, "{}", lost);
            }
            round_token.cancel();
        }

        debug!(state = %RoundState::Barrier, reported = tally.reported, "All workers reported");

        if self.workers.is_empty() {
            return Err(Error::no_devices("every worker was lost"));
        }

        let outcome = RoundOutcome {
            round: self.round,
            problem: Problem::clone(&problem),
            total_hashes: tally.total_hashes,
            winner: tally.winner,
            workers: dispatched.len(),
            failed_workers: tally.failed_workers,
            preempted,
            elapsed: started.elapsed(),
        };
        self.stats.record_round(&outcome);

        info!(
            hashes = outcome.total_hashes,
            rate = %format_hash_rate(outcome.hash_rate()),
            solved = outcome.winner.is_some(),
            preempted = outcome.preempted,
            "Round complete"
        );
        Ok(outcome)
    }

    /// Submit the round's winner, if any; failures never stop mining
    async fn submit(&mut self, outcome: &RoundOutcome) {
        let Some(winner) = outcome.winner else {
            return;
        };
        if outcome.preempted {
            info!(nonce = %winner.nonce, "Dropping solution for superseded work");
            return;
        }

        debug!(state = %RoundState::Submitting, device = winner.device, nonce = %winner.nonce, "Submitting solution");
        match self
            .source
            .submit_solution(&outcome.problem, winner.nonce)
            .await
        {
            Ok(()) => {
                self.stats.submissions_accepted += 1;
                info!(device = winner.device, nonce = %winner.nonce, "Solution accepted");
            }
            Err(e) => {
                self.stats.submissions_failed += 1;
                warn!(category = e.category(), "Failed to submit solution: {}", e);
            }
        }
    }
}

/// Whether the work source has moved past `header_hash`
async fn work_changed(source: Arc<dyn WorkSource>, header_hash: Hash) -> bool {
    match source.fetch_problem().await {
        Ok(current) => current.header_hash != header_hash,
        Err(e) => {
            debug!("Stale work check failed: {}", e);
            false
        }
    }
}

async fn stale_result(check: &mut Option<JoinHandle<bool>>) -> bool {
    match check {
        Some(handle) => handle.await.unwrap_or(false),
        None => std::future::pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Hash, Nonce, SearchResult, Target};

    fn report(device: DeviceId, result: SearchResult, error: Option<Error>) -> WorkerReport {
        WorkerReport {
            device,
            result,
            error,
        }
    }

    #[test]
    fn test_tally_first_winner_sticks() {
        let mut tally = RoundTally::default();
        assert!(!tally.record(&report(0, SearchResult::exhausted(10), None)));
        assert!(tally.record(&report(1, SearchResult::solved(5, Nonce::new(7)), None)));
        assert!(!tally.record(&report(2, SearchResult::solved(3, Nonce::new(9)), None)));

        assert_eq!(tally.total_hashes, 18);
        assert_eq!(tally.reported, 3);
        assert_eq!(
            tally.winner,
            Some(Winner {
                device: 1,
                nonce: Nonce::new(7)
            })
        );
    }

    #[test]
    fn test_tally_counts_failed_work() {
        let mut tally = RoundTally::default();
        tally.record(&report(0, SearchResult::exhausted(40), Some(Error::device(0, "gone"))));
        assert_eq!(tally.failed_workers, 1);
        assert_eq!(tally.total_hashes, 40);
        assert!(tally.winner.is_none());
    }

    #[test]
    fn test_stats_record_round() {
        let mut stats = MinerStats::default();
        let mut outcome = RoundOutcome {
            round: 1,
            problem: Problem::new(Hash::default(), Target::max()),
            total_hashes: 500,
            winner: Some(Winner {
                device: 0,
                nonce: Nonce::new(1),
            }),
            workers: 2,
            failed_workers: 1,
            preempted: false,
            elapsed: Duration::from_secs(5),
        };
        stats.record_round(&outcome);
        outcome.winner = None;
        outcome.preempted = true;
        stats.record_round(&outcome);

        assert_eq!(stats.rounds, 2);
        assert_eq!(stats.solutions, 1);
        assert_eq!(stats.preempted_rounds, 1);
        assert_eq!(stats.worker_errors, 2);
        assert_eq!(stats.total_hashes, 1000);
        assert_eq!(stats.average_hash_rate(), 100.0);
    }

    #[test]
    fn test_round_state_display() {
        assert_eq!(RoundState::AwaitingResult.to_string(), "awaiting_result");
        assert_eq!(RoundState::Barrier.to_string(), "barrier");
    }
}
