//! JDWP-over-WebSocket tunnel.
//!
//! Two roles share this binary. The initiator runs next to the debugger and
//! turns local TCP connections into authenticated WebSocket tunnels; the
//! acceptor runs next to the debuggee, verifies each upgrade and bridges it
//! to an allow-listed JDWP port.
//!
//! ## Usage
//! ```bash
//! # next to the debuggee
//! jdwptun acceptor --allowed-ports 5005
//!
//! # next to the debugger, with the published key file at hand
//! jdwptun initiator --server-host debug.example.com --jdwp-port 5005
//! ```

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use jdwptun::acceptor::Acceptor;
use jdwptun::config::{AcceptorArgs, Cli, Command, InitiatorArgs};
use jdwptun::initiator::Initiator;
use jdwptun::keys;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Initiator(args) => run_initiator(args).await,
        Command::Acceptor(args) => run_acceptor(args).await,
    }
}

async fn run_initiator(args: InitiatorArgs) -> anyhow::Result<()> {
    info!(
        "Starting initiator: {}",
        serde_json::to_string(&args).unwrap_or_default()
    );

    let public_key = keys::read_public_key(&args.key_file)
        .with_context(|| format!("can't load the public key from {}", args.key_file.display()))?;

    Initiator::new(&args, public_key).start().await
}

async fn run_acceptor(args: AcceptorArgs) -> anyhow::Result<()> {
    info!(
        "Starting acceptor: {}",
        serde_json::to_string(&args).unwrap_or_default()
    );

    let private_key = keys::init_key_pair(&args.key_file)
        .with_context(|| format!("can't publish the public key to {}", args.key_file.display()))?;

    spawn_deadline_guard(args.deadline);

    Acceptor::new(&args, private_key).start().await
}

/// Debug endpoints should not outlive the debugging session. The acceptor
/// shuts itself down after the configured number of minutes; 0 disables the
/// guard.
fn spawn_deadline_guard(deadline_mins: u64) {
    if deadline_mins == 0 {
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(deadline_mins * 60)).await;
        warn!("Deadline of {deadline_mins} minutes reached, shutting down");
        std::process::exit(0);
    });
}
