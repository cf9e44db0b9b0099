/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    definition::{BenchmarkDef, Comparator, DefinitionError, Instruction},
    lifecycle::{LifecycleStore, WorkerId},
    orchestrator::Orchestrator,
    stats::Stats,
};
use std::{
    error::Error,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// How often `expect-running` re-reads the running count.
    pub poll_interval: Duration,
    /// `None` waits forever.
    pub expect_timeout: Option<Duration>,
}
impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            expect_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    AssertionFailed {
        symbol: Comparator,
        amount: usize,
        running: usize,
        waited: Duration,
    },
    Cancelled,
}
impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::AssertionFailed {
                symbol,
                amount,
                running,
                waited,
            } => write!(
                f,
                "expect-running {} {} still false after {:.1}s ({} running)",
                symbol,
                amount,
                waited.as_secs_f64(),
                running
            ),
            EngineError::Cancelled => write!(f, "benchmark was cancelled"),
        }
    }
}
impl Error for EngineError {}

/// Interprets a benchmark definition against the lifecycle store and an orchestrator.
pub struct Engine {
    benchmark: BenchmarkDef,
    store: Arc<LifecycleStore>,
    orchestrator: Arc<dyn Orchestrator>,
    options: EngineOptions,
}
impl Engine {
    pub fn new(
        benchmark: BenchmarkDef,
        store: Arc<LifecycleStore>,
        orchestrator: Arc<dyn Orchestrator>,
        options: EngineOptions,
    ) -> Result<Self, DefinitionError> {
        benchmark.validate()?;
        Ok(Self {
            benchmark,
            store,
            orchestrator,
            options,
        })
    }

    pub fn instance_group_size(&self) -> u32 {
        self.benchmark.instance_group_size
    }

    pub fn stats(&self) -> Stats {
        self.store.stats()
    }

    /// Executes every instruction in order and always finishes with a stop-all, including when
    /// an instruction fails or `token` is cancelled.
    ///
    /// `start` instructions run detached from the instruction stream: the next instruction
    /// begins straight away while spawns are still being issued. Before the final stop-all the
    /// detached starts are told to stop issuing spawns and are joined.
    pub async fn run(&self, token: CancellationToken) -> Result<(), EngineError> {
        self.store.begin();
        info!(
            "running benchmark with {} instructions",
            self.benchmark.instructions.len()
        );

        let start_token = token.child_token();
        let mut starts = JoinSet::new();
        let outcome = self.execute(&token, &start_token, &mut starts).await;

        start_token.cancel();
        while let Some(res) = starts.join_next().await {
            if let Err(err) = res {
                warn!("start task failed: {}", err);
            }
        }

        debug!("stopping every remaining unit");
        self.stop_all().await;
        outcome
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        start_token: &CancellationToken,
        starts: &mut JoinSet<()>,
    ) -> Result<(), EngineError> {
        for instruction in self.benchmark.instructions.iter() {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let slot =
                self.store
                    .open_instruction(instruction.name(), instruction.args(), Instant::now());
            debug!("{} {}", instruction.name(), instruction.args().join(" "));

            let res = match instruction {
                Instruction::Start { max, interval } => {
                    // the detached task closes its own log slot
                    starts.spawn(start(
                        self.store.clone(),
                        self.orchestrator.clone(),
                        *max,
                        Duration::from_millis(*interval),
                        start_token.clone(),
                        slot,
                    ));
                    continue;
                }
                Instruction::Float { rate, duration } => {
                    self.float(*rate, Duration::from_millis(*duration));
                    Ok(())
                }
                Instruction::Sleep(secs) => sleep(Duration::from_secs(*secs), token).await,
                Instruction::ExpectRunning { symbol, amount } => {
                    self.expect_running(*symbol, *amount, token).await
                }
                Instruction::StopAll => {
                    self.stop_all().await;
                    Ok(())
                }
            };

            self.store.close_instruction(slot, Instant::now());
            res?;
        }
        Ok(())
    }

    /// Placeholder for a load generator that varies the spawn rate over `duration`. Until one
    /// exists the instruction only shows up in the log.
    fn float(&self, rate: f64, duration: Duration) {
        debug!(
            "float instruction not implemented yet (rate {}, {}ms)",
            rate,
            duration.as_millis()
        );
    }

    async fn expect_running(
        &self,
        symbol: Comparator,
        amount: usize,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let waiting_since = Instant::now();
        loop {
            let running = self.store.counts().running;
            if symbol.holds(running, amount) {
                return Ok(());
            }

            let waited = waiting_since.elapsed();
            if let Some(timeout) = self.options.expect_timeout {
                if waited >= timeout {
                    return Err(EngineError::AssertionFailed {
                        symbol,
                        amount,
                        running,
                        waited,
                    });
                }
            }

            sleep(self.options.poll_interval, token).await?;
        }
    }

    /// Requests a stop for every Starting or Running unit and waits for all stop calls to
    /// return. Failed stops are logged; the units stay in Stopping.
    async fn stop_all(&self) {
        let ids = self.store.request_stop_all();
        if ids.is_empty() {
            return;
        }

        debug!("requesting stop for {} units", ids.len());
        let mut stops = JoinSet::new();
        for id in ids {
            let orchestrator = self.orchestrator.clone();
            stops.spawn(async move {
                if let Err(err) = orchestrator.stop(&id).await {
                    warn!("{:#}", err);
                }
            });
        }

        while let Some(res) = stops.join_next().await {
            if let Err(err) = res {
                warn!("stop task failed: {}", err);
            }
        }
    }
}

async fn sleep(duration: Duration, token: &CancellationToken) -> Result<(), EngineError> {
    tokio::select! {
        _ = token.cancelled() => Err(EngineError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Issues `max` spawns, one every `interval`, each on its own task so a slow orchestrator does
/// not hold back the rate. Returns once every issued spawn call has returned.
async fn start(
    store: Arc<LifecycleStore>,
    orchestrator: Arc<dyn Orchestrator>,
    max: u32,
    interval: Duration,
    token: CancellationToken,
    slot: usize,
) {
    let mut spawns = JoinSet::new();
    for spawned in 0..max {
        if token.is_cancelled() {
            warn!("start interrupted after {} of {} spawns", spawned, max);
            break;
        }

        spawns.spawn(spawn_unit(store.clone(), orchestrator.clone()));

        if sleep(interval, &token).await.is_err() && spawned + 1 < max {
            warn!("start interrupted after {} of {} spawns", spawned + 1, max);
            break;
        }
    }

    while let Some(res) = spawns.join_next().await {
        if let Err(err) = res {
            warn!("spawn task failed: {}", err);
        }
    }
    store.close_instruction(slot, Instant::now());
}

async fn spawn_unit(store: Arc<LifecycleStore>, orchestrator: Arc<dyn Orchestrator>) {
    let id = WorkerId::generate();
    if let Err(err) = store.request_start(id.clone()) {
        warn!("{}", err);
        return;
    }

    if let Err(err) = orchestrator.spawn(&id).await {
        warn!("{:#}", err);
    }
}
