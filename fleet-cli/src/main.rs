//! Fleet: configuration deployment orchestrator CLI.
//!
//! # Usage
//!
//! ```text
//! fleet init
//! fleet object list [--class <class>] [--json]
//! fleet object show <id>
//! fleet object put <file.yaml> [--id <id>]
//! fleet plan [target] [--diff] [--json]
//! fleet deploy plan [target] | toggle <index> --enabled <bool> | start | stop | cancel | status | diff <index> | watch
//! fleet daemon start|stop|status
//! fleet host log <host-id> [--unit <unit>]
//! ```

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, deploy::DeployCommand, host::HostCommand, init::InitArgs,
    object::ObjectCommand, plan::PlanArgs,
};
use fleet_core::ObjectClass;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "fleet",
    version,
    about = "Plan and deploy host configuration across a fleet",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create ~/.fleet and seed the root object.
    Init(InitArgs),

    /// Inspect and edit configuration objects.
    Object {
        #[command(subcommand)]
        command: ObjectCommand,
    },

    /// Preview the deployment plan offline, without a daemon.
    Plan(PlanArgs),

    /// Drive a deployment through the daemon.
    Deploy {
        #[command(subcommand)]
        command: DeployCommand,
    },

    /// Run or control the deployment daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Interact with connected hosts.
    Host {
        #[command(subcommand)]
        command: HostCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared ObjectClass argument
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `ObjectClass` from CLI args.
#[derive(Debug, Clone, Copy)]
pub struct ObjectClassArg(pub ObjectClass);

impl FromStr for ObjectClassArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let class = match s.to_ascii_lowercase().as_str() {
            "root" => ObjectClass::Root,
            "host" => ObjectClass::Host,
            "user" => ObjectClass::User,
            "group" => ObjectClass::Group,
            "file" => ObjectClass::File,
            "package" => ObjectClass::Package,
            "collection" => ObjectClass::Collection,
            "firewall-rule" | "ufw" => ObjectClass::FirewallRule,
            other => {
                return Err(format!(
                    "unknown class '{other}'; expected: root, host, user, group, file, package, collection, firewall-rule"
                ))
            }
        };
        Ok(Self(class))
    }
}

impl fmt::Display for ObjectClassArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Object { command } => commands::object::run(command),
        Commands::Plan(args) => args.run(),
        Commands::Deploy { command } => commands::deploy::run(command),
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Host { command } => commands::host::run(command),
    }
}
