/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a benchmark against the fleet
    Run {
        /// Path to the fleemmer.toml config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address the callback server listens on, overrides [server] bind
        #[arg(short, long)]
        addr: Option<String>,

        #[command(flatten)]
        benchmark: BenchmarkSource,

        /// Number of processes in every unit, used with --raw-instructions
        #[arg(long, default_value_t = 1)]
        instance_group_size: u32,

        /// Write the collected statistics as JSON to this file (`-` for stdout)
        #[arg(long, value_name = "FILE")]
        dump_json: Option<String>,

        /// Do not plot the start delay histogram
        #[arg(long)]
        no_histogram: bool,
    },

    /// Push process metrics to a running benchmark's callback server
    Agent {
        /// Callback server address, e.g. 10.0.0.1:40302
        #[arg(short, long)]
        server: String,

        /// Label the samples are recorded under
        #[arg(short, long)]
        label: String,

        #[command(flatten)]
        target: AgentTarget,

        /// Seconds between two samples
        #[arg(short, long, default_value_t = 1)]
        interval: u64,
    },
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
pub struct BenchmarkSource {
    /// Path to a TOML benchmark definition
    #[arg(short, long)]
    pub benchmark_file: Option<PathBuf>,

    /// Instructions inline, e.g. "(start 10 100) (expect-running > 9) (stop-all)"
    #[arg(short, long)]
    pub raw_instructions: Option<String>,
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
pub struct AgentTarget {
    /// Pid of the process to sample
    #[arg(long)]
    pub pid: Option<u32>,

    /// Name of the processes to sample, summed together
    #[arg(long)]
    pub name: Option<String>,
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benchmark_sources_are_exclusive() {
        let args = Args::try_parse_from(["fleemmer", "run", "-r", "(stop-all)", "-b", "bench.toml"]);
        assert!(args.is_err());

        let args = Args::try_parse_from(["fleemmer", "run"]);
        assert!(args.is_err());
    }

    #[test]
    fn can_parse_run() -> anyhow::Result<()> {
        let args = Args::try_parse_from([
            "fleemmer",
            "-v",
            "run",
            "--raw-instructions",
            "(start 2 0) (stop-all)",
            "--instance-group-size",
            "4",
            "--dump-json",
            "-",
        ])?;
        assert!(args.verbose);

        match args.command {
            Commands::Run {
                benchmark,
                instance_group_size,
                dump_json,
                no_histogram,
                ..
            } => {
                assert_eq!(benchmark.raw_instructions.as_deref(), Some("(start 2 0) (stop-all)"));
                assert!(benchmark.benchmark_file.is_none());
                assert_eq!(instance_group_size, 4);
                assert_eq!(dump_json.as_deref(), Some("-"));
                assert!(!no_histogram);
            }
            _ => panic!("expected run"),
        }
        Ok(())
    }

    #[test]
    fn agent_needs_one_target() -> anyhow::Result<()> {
        assert!(Args::try_parse_from(["fleemmer", "agent", "-s", "h:1", "-l", "x"]).is_err());

        let args = Args::try_parse_from(["fleemmer", "agent", "-s", "h:1", "-l", "x", "--pid", "7"])?;
        match args.command {
            Commands::Agent { target, interval, .. } => {
                assert_eq!(target.pid, Some(7));
                assert_eq!(interval, 1);
            }
            _ => panic!("expected agent"),
        }
        Ok(())
    }
}
