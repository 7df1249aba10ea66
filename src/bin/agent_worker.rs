//! Hosts one agent of a race for the process and TCP isolators.
//!
//! ```text
//! agent-worker                     # commands on stdin, results on stdout
//! agent-worker --connect <address> # connect to a TCP isolator
//! ```

use std::env;
use std::net::SocketAddr;

use anyhow::{bail, Context};
use tracing::{debug, warn};

use ai_game_engine::isolation::worker::{connect_worker, run_worker};
use ai_game_engine::logger::init_logger;
use ai_game_engine::prelude::*;

fn main() -> anyhow::Result<()> {
    // stdout is the result channel: logs go to stderr only
    if let Err(e) = init_logger(false) {
        eprintln!("agent-worker: {e:#}");
    }

    let mut args = env::args().skip(1);
    let registry = AgentRegistry::<RaceState>::with_builtin();

    match args.next().as_deref() {
        None => {
            debug!(pid = std::process::id(), "serving on stdio");
            let stdin = std::io::stdin().lock();
            run_worker(&registry, stdin, std::io::stdout())
        }
        Some("--connect") => {
            let address: SocketAddr = args
                .next()
                .context("--connect needs an address")?
                .parse()
                .context("invalid address")?;
            connect_worker(&registry, address)
        }
        Some(other) => {
            warn!(argument = other, "unexpected argument");
            bail!("usage: agent-worker [--connect <address>]")
        }
    }
}
