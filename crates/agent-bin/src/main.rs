//! `healthagentd`: the health agent daemon.
//!
//! Runs as a long-lived process, or, when invoked with `--pool-worker`, as a
//! short-lived child that performs exactly one isolated job and exits — see
//! [`healthagent_scheduler::run_pool_worker`].

use std::path::PathBuf;

use clap::Parser;
use healthagent_agent::{Agent, Config};

/// Health agent daemon command line arguments.
#[derive(Parser, Debug)]
#[command(name = "healthagentd")]
#[command(about = "GPU-equipped compute node health agent")]
struct Args {
    /// Run with verbose debug logging and self-observation periodics.
    #[arg(long)]
    debug: bool,

    /// Override the working directory (default: $HEALTHAGENT_DIR or /opt/healthagent).
    #[arg(long, value_name = "PATH")]
    workdir: Option<PathBuf>,

    /// Internal: run as an isolated pool-job worker, reading one job from
    /// stdin and writing its result to stdout. Never invoked directly by a
    /// user.
    #[arg(long, hide = true)]
    pool_worker: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.pool_worker {
        std::process::exit(healthagent_scheduler::run_pool_worker());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if args.debug { "debug".into() } else { "info".into() }
        }))
        .init();

    let config = Config::load(args.debug, args.workdir);
    let agent = Agent::new(config);
    agent.run().await
}
