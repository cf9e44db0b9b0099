/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::Colorize;
use fleemmer::{
    agent::{Agent, Target},
    callback_server,
    clap_args::{self, AgentTarget, BenchmarkSource, Commands},
    config::Config,
    definition::BenchmarkDef,
    engine::{Engine, EngineError, EngineOptions},
    lifecycle::LifecycleStore,
    orchestrator::CommandOrchestrator,
    report,
};
use std::{path::Path, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, subscriber::set_global_default, warn, Subscriber};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "fleemmer.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // dotenv
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    let log_level = if args.verbose { "debug" } else { "info" };
    init_subscriber(get_subscriber(log_level.into()))?;

    match args.command {
        Commands::Run {
            config,
            addr,
            benchmark,
            instance_group_size,
            dump_json,
            no_histogram,
        } => {
            let default_path = Path::new(DEFAULT_CONFIG);
            let config = match config {
                Some(path) => Config::try_from_path(&path)?,
                None if default_path.exists() => Config::try_from_path(default_path)?,
                None => Config::default(),
            };
            let benchmark = load_benchmark(benchmark, instance_group_size)?;
            run(config, addr, benchmark, dump_json, no_histogram).await
        }

        Commands::Agent {
            server,
            label,
            target,
            interval,
        } => {
            let agent = Agent::new(
                &server,
                &label,
                agent_target(target)?,
                Duration::from_secs(interval.max(1)),
            );
            let token = CancellationToken::new();
            cancel_on_ctrl_c(token.clone());
            agent.run(token).await
        }
    }
}

async fn run(
    mut config: Config,
    addr: Option<String>,
    benchmark: BenchmarkDef,
    dump_json: Option<String>,
    no_histogram: bool,
) -> anyhow::Result<()> {
    if let Some(addr) = addr {
        config.server.bind = addr;
    }

    let store = Arc::new(LifecycleStore::new());
    let orchestrator = Arc::new(CommandOrchestrator::new(
        config.orchestrator()?,
        config.server.callback_addr(),
        benchmark.instance_group_size,
    ));
    let engine = Engine::new(
        benchmark,
        store.clone(),
        orchestrator.clone(),
        EngineOptions::from(&config.engine),
    )?;

    let server_token = CancellationToken::new();
    let server =
        callback_server::start(&config.server.bind, store.clone(), server_token.clone()).await?;

    let run_token = CancellationToken::new();
    cancel_on_ctrl_c(run_token.clone());

    info!(
        "Running benchmark, units of {} processes call back on {}",
        engine.instance_group_size(),
        config.server.callback_addr()
    );
    let outcome = engine.run(run_token).await;
    match &outcome {
        Ok(()) => info!("Benchmark complete"),
        Err(EngineError::Cancelled) => warn!("Benchmark interrupted, every unit was asked to stop"),
        Err(err) => error!("{}", err),
    }

    if let Err(err) = orchestrator.cleanup().await {
        warn!("{:#}", err);
    }

    server_token.cancel();
    match server.await {
        Ok(Err(err)) => warn!("callback server: {:#}", err),
        Err(err) => warn!("callback server task failed: {}", err),
        Ok(Ok(())) => {}
    }

    let stats = engine.stats();
    let to_stdout = dump_json.as_deref() == Some("-");
    if !to_stdout {
        report::print_summary(&stats, store.counts());
        if !no_histogram {
            report::print_histogram(&stats);
        }
    }
    if let Some(target) = dump_json {
        report::dump_json(&stats, &target)?;
    }

    if let Err(err) = outcome {
        if !to_stdout {
            println!("{}", err.to_string().red());
        }
        return Err(err.into());
    }
    Ok(())
}

fn load_benchmark(
    source: BenchmarkSource,
    instance_group_size: u32,
) -> anyhow::Result<BenchmarkDef> {
    match (source.benchmark_file, source.raw_instructions) {
        (Some(path), _) => BenchmarkDef::try_from_path(&path),
        (None, Some(raw)) => BenchmarkDef::try_from_raw(&raw, instance_group_size)
            .context("Unable to parse raw instructions"),
        (None, None) => Err(anyhow::anyhow!(
            "Either --benchmark-file or --raw-instructions is required"
        )),
    }
}

fn agent_target(target: AgentTarget) -> anyhow::Result<Target> {
    match (target.pid, target.name) {
        (Some(pid), _) => Ok(Target::Pid(pid)),
        (None, Some(name)) => Ok(Target::Name(name)),
        (None, None) => Err(anyhow::anyhow!("Either --pid or --name is required")),
    }
}

/// First Ctrl-C cancels `token` and lets the run wind down, the second one exits at once.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Interrupted, shutting down. Press Ctrl-C again to exit immediately");
        token.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted twice, exiting without waiting for units to stop");
            std::process::exit(130);
        }
    });
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber).context("Failed to set subscriber")
}
