/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::stats::{Counts, Recorder, StatSample, Stats, StatsLine};
use serde::Serialize;
use std::{
    borrow::Borrow,
    collections::HashMap,
    error::Error,
    fmt,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tracing::{trace, warn};

const WORKER_ID_LEN: usize = 16;

// no `-` or `_`, ids end up as bare arguments in orchestrator commands
const WORKER_ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
    'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
    'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
];

/// Random token correlating one spawn request with the callbacks of the worker it created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(String);
impl WorkerId {
    pub fn generate() -> Self {
        WorkerId(nanoid::nanoid!(WORKER_ID_LEN, &WORKER_ID_ALPHABET))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        WorkerId(id.to_string())
    }
}
impl Borrow<str> for WorkerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamps of one worker. Each is set at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitState {
    pub start_requested: Instant,
    pub actual_start: Option<Instant>,
    pub stop_requested: Option<Instant>,
    pub actual_stop: Option<Instant>,
}
impl UnitState {
    fn requested_at(at: Instant) -> Self {
        Self {
            start_requested: at,
            actual_start: None,
            stop_requested: None,
            actual_stop: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    AlreadyKnown(String),
    NotStarting(String),
    NotActive(String),
    NotStopping(String),
}
impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::AlreadyKnown(id) => write!(f, "unit {} is already tracked", id),
            TransitionError::NotStarting(id) => {
                write!(f, "unit {} cannot be found in the starting pool", id)
            }
            TransitionError::NotActive(id) => write!(
                f,
                "unit {} cannot be found in the starting or running pool",
                id
            ),
            TransitionError::NotStopping(id) => {
                write!(f, "unit {} cannot be found in the stopping pool", id)
            }
        }
    }
}
impl Error for TransitionError {}

#[derive(Debug, Default)]
struct Pools {
    starting: HashMap<WorkerId, UnitState>,
    running: HashMap<WorkerId, UnitState>,
    stopping: HashMap<WorkerId, UnitState>,
    stopped: HashMap<WorkerId, UnitState>,
    recorder: Recorder,
}
impl Pools {
    fn counts(&self) -> Counts {
        Counts {
            starting: self.starting.len(),
            running: self.running.len(),
            stopping: self.stopping.len(),
            stopped: self.stopped.len(),
        }
    }

    fn phase_of(&self, id: &str) -> Option<Phase> {
        if self.starting.contains_key(id) {
            Some(Phase::Starting)
        } else if self.running.contains_key(id) {
            Some(Phase::Running)
        } else if self.stopping.contains_key(id) {
            Some(Phase::Stopping)
        } else if self.stopped.contains_key(id) {
            Some(Phase::Stopped)
        } else {
            None
        }
    }

    fn sample(&self, id: &WorkerId, requested: Instant, completed: Instant) -> StatSample {
        StatSample {
            id: id.to_string(),
            start_time: self.recorder.seconds_since_start(requested),
            completion_time: self.recorder.seconds_since_start(completed),
            delay: completed.saturating_duration_since(requested).as_secs_f64(),
            counts: self.counts(),
        }
    }
}

/// Authoritative record of which phase every worker is in. Every mapping, and the statistics
/// derived from transitions between them, sit behind one mutex. No method calls out while
/// holding it.
#[derive(Debug, Default)]
pub struct LifecycleStore {
    pools: Mutex<Pools>,
}
impl LifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn pools(&self) -> MutexGuard<'_, Pools> {
        self.pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks the start of the benchmark; statistics timestamps are relative to this.
    pub fn begin(&self) {
        self.pools().recorder.reset_epoch();
    }

    pub fn request_start(&self, id: WorkerId) -> Result<(), TransitionError> {
        let mut pools = self.pools();
        if pools.phase_of(id.as_str()).is_some() {
            return Err(TransitionError::AlreadyKnown(id.to_string()));
        }
        trace!("unit {} requested to start", id);
        pools.starting.insert(id, UnitState::requested_at(Instant::now()));
        Ok(())
    }

    /// Moves a worker from Starting to Running and returns how long it took to come up.
    pub fn mark_running(&self, id: &str) -> Result<Duration, TransitionError> {
        let mut pools = self.pools();
        let Some((id, mut state)) = pools.starting.remove_entry(id) else {
            let err = TransitionError::NotStarting(id.to_string());
            warn!("{}", err);
            return Err(err);
        };

        let now = Instant::now();
        state.actual_start = Some(now);
        pools.running.insert(id.clone(), state);

        let sample = pools.sample(&id, state.start_requested, now);
        pools.recorder.push_start(sample);
        Ok(now.saturating_duration_since(state.start_requested))
    }

    /// Moves a worker from Starting or Running to Stopping.
    pub fn request_stop(&self, id: &str) -> Result<(), TransitionError> {
        let mut pools = self.pools();
        let from_starting = pools.starting.remove_entry(id);
        let entry = match from_starting {
            Some(entry) => Some(entry),
            None => pools.running.remove_entry(id),
        };
        let Some((id, mut state)) = entry else {
            return Err(TransitionError::NotActive(id.to_string()));
        };

        state.stop_requested = Some(Instant::now());
        pools.stopping.insert(id, state);
        Ok(())
    }

    /// Moves every Starting and Running worker to Stopping in one critical section and returns
    /// their ids.
    pub fn request_stop_all(&self) -> Vec<WorkerId> {
        let mut pools = self.pools();
        let now = Instant::now();

        let mut drained = pools.starting.drain().collect::<Vec<_>>();
        drained.extend(pools.running.drain());

        let mut ids = Vec::with_capacity(drained.len());
        for (id, mut state) in drained {
            state.stop_requested = Some(now);
            ids.push(id.clone());
            pools.stopping.insert(id, state);
        }
        ids
    }

    /// Moves a worker from Stopping to Stopped and returns how long it took to go away.
    pub fn mark_stopped(&self, id: &str) -> Result<Duration, TransitionError> {
        let mut pools = self.pools();
        let Some((id, mut state)) = pools.stopping.remove_entry(id) else {
            let err = TransitionError::NotStopping(id.to_string());
            warn!("{}", err);
            return Err(err);
        };

        let now = Instant::now();
        let requested = state.stop_requested.unwrap_or(now);
        state.actual_stop = Some(now);
        pools.stopped.insert(id.clone(), state);

        let sample = pools.sample(&id, requested, now);
        pools.recorder.push_stop(sample);
        Ok(now.saturating_duration_since(requested))
    }

    pub fn counts(&self) -> Counts {
        self.pools().counts()
    }

    pub fn phase_of(&self, id: &str) -> Option<Phase> {
        self.pools().phase_of(id)
    }

    pub fn is_stopping(&self, id: &str) -> bool {
        self.phase_of(id) == Some(Phase::Stopping)
    }

    pub fn unit_state(&self, id: &str) -> Option<UnitState> {
        let pools = self.pools();
        let state = [&pools.starting, &pools.running, &pools.stopping, &pools.stopped]
            .into_iter()
            .find_map(|pool| pool.get(id).copied());
        state
    }

    pub fn record_process_stats(&self, label: &str, line: StatsLine) {
        self.pools()
            .recorder
            .push_process_stats(label, line, Instant::now());
    }

    pub fn open_instruction(&self, name: &str, args: Vec<String>, start: Instant) -> usize {
        self.pools().recorder.open_instruction(name, args, start)
    }

    pub fn close_instruction(&self, index: usize, end: Instant) {
        self.pools().recorder.close_instruction(index, end)
    }

    pub fn stats(&self) -> Stats {
        self.pools().recorder.snapshot()
    }
}
