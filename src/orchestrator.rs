/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{config::OrchestratorConfig, lifecycle::WorkerId};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// The layer that actually creates and destroys workers. Both calls may fail; the engine logs
/// failures and carries on.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Provision one worker group configured to call back with `id`.
    async fn spawn(&self, id: &WorkerId) -> anyhow::Result<()>;

    /// Request termination of the worker group identified by `id`.
    async fn stop(&self, id: &WorkerId) -> anyhow::Result<()>;
}

/// Orchestrates workers by running shell command templates. The placeholders `{id}`,
/// `{callback}` and `{group_size}` are substituted before the command runs.
#[derive(Debug, Clone)]
pub struct CommandOrchestrator {
    spawn: String,
    stop: String,
    cleanup: Option<String>,
    callback: String,
    group_size: u32,
    timeout: Option<Duration>,
}
impl CommandOrchestrator {
    pub fn new(config: &OrchestratorConfig, callback: &str, group_size: u32) -> Self {
        Self {
            spawn: config.spawn.clone(),
            stop: config.stop.clone(),
            cleanup: config.cleanup.clone(),
            callback: callback.to_string(),
            group_size,
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }

    fn render(&self, template: &str, id: Option<&WorkerId>) -> String {
        let command = template
            .replace("{callback}", &self.callback)
            .replace("{group_size}", &self.group_size.to_string());
        match id {
            Some(id) => command.replace("{id}", id.as_str()),
            None => command,
        }
    }

    /// Runs the configured cleanup command, if any, once the benchmark is over.
    pub async fn cleanup(&self) -> anyhow::Result<()> {
        match &self.cleanup {
            Some(template) => run_command(&self.render(template, None), self.timeout).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Orchestrator for CommandOrchestrator {
    async fn spawn(&self, id: &WorkerId) -> anyhow::Result<()> {
        let command = self.render(&self.spawn, Some(id));
        debug!("spawning unit with id {}", id);
        run_command(&command, self.timeout)
            .await
            .context(format!("Failed to spawn unit {}", id))
    }

    async fn stop(&self, id: &WorkerId) -> anyhow::Result<()> {
        let command = self.render(&self.stop, Some(id));
        debug!("stopping unit with id {}", id);
        run_command(&command, self.timeout)
            .await
            .context(format!("Failed to stop unit {}", id))
    }
}

/// Runs a command to completion, failing on a non-zero exit status. A command outliving
/// `timeout` is killed and reported as a failure.
async fn run_command(command: &str, timeout: Option<Duration>) -> anyhow::Result<()> {
    // break command string into POSIX words
    let words = shlex::split(command)
        .ok_or_else(|| anyhow!("Command string is not POSIX compliant: {}", command))?;

    match &words[..] {
        [program, args @ ..] => {
            let mut cmd = tokio::process::Command::new(program);
            cmd.args(args).kill_on_drop(true);
            let output = cmd.output();
            let output = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, output)
                    .await
                    .map_err(|_| anyhow!("Command timed out after {:?}: {}", timeout, command))?,
                None => output.await,
            }
            .context(format!("Tokio command failed to run {program}"))?;

            if output.status.success() {
                Ok(())
            } else {
                let error_message = String::from_utf8_lossy(&output.stderr).to_string();
                Err(anyhow!(
                    "Command exited with {}: {}. Command: {}",
                    output.status,
                    error_message.trim(),
                    command
                ))
            }
        }
        _ => Err(anyhow!("Empty command")),
    }
}
