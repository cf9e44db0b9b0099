/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::BTreeMap, str::FromStr, time::Instant};

/// Sizes of the four lifecycle mappings at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub starting: usize,
    pub running: usize,
    pub stopping: usize,
    pub stopped: usize,
}

/// Measurement taken when a worker reaches Running or Stopped. All times are seconds since the
/// benchmark started.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatSample {
    pub id: String,
    pub start_time: f64,
    pub completion_time: f64,
    pub delay: f64,
    #[serde(flatten)]
    pub counts: Counts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructionLogEntry {
    pub name: String,
    pub args: Vec<String>,
    pub start_time: f64,
    /// `None` while a detached `start` is still issuing spawns.
    pub end_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatSample {
    pub process: String,
    pub timestamp: f64,
    pub cpu_usage: f64,
    pub rss: u64,
}

/// A metrics line pushed by an agent: `"<hostname> <cpu usage> <rss>"`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsLine {
    pub hostname: String,
    pub cpu_usage: f64,
    pub rss: u64,
}
impl FromStr for StatsLine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_whitespace().collect::<Vec<_>>()[..] {
            [hostname, cpu_usage, rss] => Ok(StatsLine {
                hostname: hostname.to_string(),
                cpu_usage: cpu_usage
                    .parse()
                    .context(format!("cpu usage '{}' is not a number", cpu_usage))?,
                rss: rss
                    .parse()
                    .context(format!("rss '{}' is not an integer", rss))?,
            }),
            _ => Err(anyhow!("expected '<hostname> <cpu> <rss>', got '{}'", s.trim())),
        }
    }
}
impl std::fmt::Display for StatsLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.hostname, self.cpu_usage, self.rss)
    }
}

/// Everything collected during a run, handed to reporting once the run is over.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub started_at: DateTime<Utc>,
    pub start: Vec<StatSample>,
    pub stop: Vec<StatSample>,
    pub event_log: Vec<InstructionLogEntry>,
    pub machine_stats: BTreeMap<String, Vec<ProcessStatSample>>,
}

/// Append-only accumulator. It has no lock of its own; the lifecycle store owns it and only
/// touches it while holding the store lock.
#[derive(Debug)]
pub struct Recorder {
    epoch: Instant,
    started_at: DateTime<Utc>,
    start: Vec<StatSample>,
    stop: Vec<StatSample>,
    event_log: Vec<InstructionLogEntry>,
    machine_stats: BTreeMap<String, Vec<ProcessStatSample>>,
}
impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}
impl Recorder {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            started_at: Utc::now(),
            start: vec![],
            stop: vec![],
            event_log: vec![],
            machine_stats: BTreeMap::new(),
        }
    }

    /// Moves time zero to now.
    pub fn reset_epoch(&mut self) {
        self.epoch = Instant::now();
        self.started_at = Utc::now();
    }

    pub fn seconds_since_start(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.epoch).as_secs_f64()
    }

    pub fn push_start(&mut self, sample: StatSample) {
        self.start.push(sample);
    }

    pub fn push_stop(&mut self, sample: StatSample) {
        self.stop.push(sample);
    }

    /// Reserves a log slot for an instruction and returns its index.
    pub fn open_instruction(&mut self, name: &str, args: Vec<String>, start: Instant) -> usize {
        self.event_log.push(InstructionLogEntry {
            name: name.to_string(),
            args,
            start_time: self.seconds_since_start(start),
            end_time: None,
        });
        self.event_log.len() - 1
    }

    pub fn close_instruction(&mut self, index: usize, end: Instant) {
        let end_time = self.seconds_since_start(end);
        if let Some(entry) = self.event_log.get_mut(index) {
            entry.end_time = Some(end_time);
        }
    }

    pub fn push_process_stats(&mut self, label: &str, line: StatsLine, at: Instant) {
        let sample = ProcessStatSample {
            process: label.to_string(),
            timestamp: self.seconds_since_start(at),
            cpu_usage: line.cpu_usage,
            rss: line.rss,
        };
        self.machine_stats
            .entry(line.hostname)
            .or_default()
            .push(sample);
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            started_at: self.started_at,
            start: self.start.clone(),
            stop: self.stop.clone(),
            event_log: self.event_log.clone(),
            machine_stats: self.machine_stats.clone(),
        }
    }
}
