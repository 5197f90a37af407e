//! `healthagent-client`: a thin Unix-socket client for `healthagentd`.
//!
//! Sends exactly one command, half-closes its write side, reads the
//! response until the server closes the connection, and prints the decoded
//! JSON. Mirrors the original Python client's three modes; `--prolog`
//! carries forward as a recognized no-op, matching the original (pre-job
//! validation was never implemented there either).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const DEFAULT_WORKDIR: &str = "/opt/healthagent";

/// Process exit code used when the daemon can't be reached, the response
/// can't be parsed, or the request times out. The original Python client
/// used `sys.exit(-1)`; `std::process::exit` only takes a byte-wide code, so
/// this is its nearest portable equivalent.
const EXIT_NO_RESPONSE: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "healthagent-client")]
#[command(about = "Query a running healthagentd over its Unix socket")]
struct Args {
    /// Run the epilog/post-job validation healthchecks.
    #[arg(short, long, conflicts_with_all = ["prolog", "status"])]
    epilog: bool,

    /// Run the prolog/pre-job validation healthchecks (not implemented upstream).
    #[arg(short, long, conflicts_with_all = ["epilog", "status"])]
    prolog: bool,

    /// Get the current health status of the node (default).
    #[arg(short, long, conflicts_with_all = ["epilog", "prolog"])]
    status: bool,

    /// Override the working directory (default: $HEALTHAGENT_DIR or /opt/healthagent).
    #[arg(long, value_name = "PATH")]
    workdir: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(tracing::Level::ERROR).init();

    if args.prolog {
        return;
    }

    let socket_path = resolve_socket_path(args.workdir);
    let (command, timeout) =
        if args.epilog { ("epilog", Duration::from_secs(1200)) } else { ("status", Duration::from_secs(30)) };

    match tokio::time::timeout(timeout, query(&socket_path, command)).await {
        Ok(Ok(response)) => {
            println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
        }
        Ok(Err(err)) => {
            tracing::error!(error = %err, "unable to reach healthagentd, is it running?");
            std::process::exit(EXIT_NO_RESPONSE);
        }
        Err(_elapsed) => {
            tracing::error!("socket timed out");
            std::process::exit(EXIT_NO_RESPONSE);
        }
    }
}

fn resolve_socket_path(workdir: Option<PathBuf>) -> PathBuf {
    let workdir =
        workdir.or_else(|| std::env::var("HEALTHAGENT_DIR").ok().map(PathBuf::from)).unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR));
    workdir.join("run").join("health.sock")
}

async fn query(socket_path: &std::path::Path, command: &str) -> anyhow::Result<serde_json::Value> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(command.as_bytes()).await?;
    stream.shutdown().await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(serde_json::from_slice(&response)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_path_is_under_the_default_workdir() {
        // SAFETY: tests run single-threaded within this process's env block.
        unsafe {
            std::env::remove_var("HEALTHAGENT_DIR");
        }
        assert_eq!(resolve_socket_path(None), std::path::Path::new("/opt/healthagent/run/health.sock"));
    }

    #[test]
    fn workdir_override_takes_precedence_over_environment() {
        // SAFETY: tests run single-threaded within this process's env block.
        unsafe {
            std::env::set_var("HEALTHAGENT_DIR", "/from/env");
        }
        assert_eq!(resolve_socket_path(Some(PathBuf::from("/from/cli"))), std::path::Path::new("/from/cli/run/health.sock"));
        unsafe {
            std::env::remove_var("HEALTHAGENT_DIR");
        }
    }
}
