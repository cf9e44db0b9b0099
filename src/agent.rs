/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::stats::StatsLine;
use anyhow::Context;
use std::{ffi::OsStr, time::Duration};
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Pid(u32),
    /// Every process with this exact name, summed.
    Name(String),
}

/// Periodically samples a local process and pushes `"<hostname> <cpu%> <rss KiB>"` to the
/// callback server's `/stats/{label}` endpoint.
pub struct Agent {
    endpoint: String,
    target: Target,
    interval: Duration,
    hostname: String,
    client: reqwest::Client,
}
impl Agent {
    pub fn new(server: &str, label: &str, target: Target, interval: Duration) -> Self {
        let server = server.trim_end_matches('/');
        let server = if server.starts_with("http://") || server.starts_with("https://") {
            server.to_string()
        } else {
            format!("http://{}", server)
        };

        Self {
            endpoint: format!("{}/stats/{}", server, label),
            target,
            interval,
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            client: reqwest::Client::new(),
        }
    }

    /// Samples and pushes until `token` is cancelled. Failed pushes are logged and retried on
    /// the next tick.
    pub async fn run(&self, token: CancellationToken) -> anyhow::Result<()> {
        let mut system = System::new_all();
        info!("pushing {:?} samples to {}", self.target, self.endpoint);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }

            system.refresh_all();
            let Some(line) = self.sample(&system) else {
                warn!("{:?} is not running", self.target);
                continue;
            };

            if let Err(err) = self.push(&line).await {
                warn!("{:#}", err);
            }
        }
    }

    pub fn sample(&self, system: &System) -> Option<StatsLine> {
        let (cpu_usage, memory) = match &self.target {
            Target::Pid(pid) => {
                let process = system.process(Pid::from_u32(*pid))?;
                (process.cpu_usage() as f64, process.memory())
            }
            Target::Name(name) => system
                .processes()
                .values()
                .filter(|process| process.name() == OsStr::new(name))
                .map(|process| (process.cpu_usage() as f64, process.memory()))
                .reduce(|(cpu_a, mem_a), (cpu_b, mem_b)| (cpu_a + cpu_b, mem_a + mem_b))?,
        };

        trace!("[{:?}] cpu_usage: {} memory: {}", self.target, cpu_usage, memory);
        Some(StatsLine {
            hostname: self.hostname.clone(),
            cpu_usage,
            rss: memory / 1024,
        })
    }

    pub async fn push(&self, line: &StatsLine) -> anyhow::Result<()> {
        self.client
            .post(&self.endpoint)
            .body(line.to_string())
            .send()
            .await
            .context(format!("Unable to push stats to {}", self.endpoint))?
            .error_for_status()
            .context("Stats push was rejected")?;
        Ok(())
    }
}
