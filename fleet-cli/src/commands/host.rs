//! `fleet host log <host-id>`: follow a host's journal through the daemon.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};

use fleet_core::ObjectId;
use fleet_daemon::{open_stream, DaemonError, DaemonRequest};

use super::home_dir;

#[derive(Subcommand, Debug)]
pub enum HostCommand {
    /// Stream log lines from a connected host.
    Log(HostLogArgs),
}

#[derive(Args, Debug)]
pub struct HostLogArgs {
    /// Host object id.
    pub host: i64,

    /// Only this service unit.
    #[arg(long)]
    pub unit: Option<String>,
}

pub fn run(cmd: HostCommand) -> Result<()> {
    match cmd {
        HostCommand::Log(args) => log(args),
    }
}

fn log(args: HostLogArgs) -> Result<()> {
    let home = home_dir()?;
    let mut req = DaemonRequest::new("journal");
    req.target = Some(ObjectId(args.host));
    req.unit = args.unit;

    let (_, batches) = open_stream(&home, &req).map_err(|err| match err {
        DaemonError::DaemonNotRunning { .. } => {
            anyhow!("daemon is not running; start it with 'fleet daemon start'")
        }
        other => anyhow::Error::new(other).context(format!("cannot follow host {}", args.host)),
    })?;

    for batch in batches {
        let batch = batch.context("log stream failed")?;
        for line in batch["lines"].as_array().into_iter().flatten() {
            println!("{}", line.as_str().unwrap_or_default());
        }
    }
    Ok(())
}
