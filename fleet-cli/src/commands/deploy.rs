//! `fleet deploy ...`: operator commands sent to the daemon.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Subcommand};
use colored::Colorize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use fleet_core::ObjectId;
use fleet_daemon::{open_stream, request, DaemonError, DaemonRequest, DeploymentEvent};
use fleet_plan::UnitView;

use super::{action_label, home_dir, status_label};

#[derive(Subcommand, Debug)]
pub enum DeployCommand {
    /// Build a plan in the daemon and enter review.
    Plan {
        /// Restrict the plan to what is reachable from this object id.
        target: Option<i64>,
    },

    /// Enable or disable one unit while reviewing.
    Toggle {
        index: usize,

        #[arg(long, action = ArgAction::Set)]
        enabled: bool,
    },

    /// Execute the reviewed plan.
    Start,

    /// Stop after the unit currently running.
    Stop,

    /// Discard the reviewed plan.
    Cancel,

    /// Show deployment state and units.
    Status {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print one unit's content diff.
    Diff { index: usize },

    /// Follow deployment events until the daemon closes the stream.
    Watch,
}

#[derive(Tabled)]
struct UnitRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "on")]
    enabled: String,
    #[tabled(rename = "host")]
    host: String,
    #[tabled(rename = "class")]
    class: String,
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "action")]
    action: String,
    #[tabled(rename = "status")]
    status: String,
}

pub fn run(cmd: DeployCommand) -> Result<()> {
    let home = home_dir()?;

    match cmd {
        DeployCommand::Plan { target } => {
            let mut req = DaemonRequest::new("plan");
            req.target = target.map(ObjectId);
            let data = call(&home, &req)?;
            if data["status"] == "invalid-tree" {
                for line in data["message"].as_str().unwrap_or_default().lines() {
                    eprintln!("{} {line}", "✗".red().bold());
                }
                anyhow::bail!("object tree is invalid");
            }
            let units: Vec<UnitView> = serde_json::from_value(data["units"].clone())
                .context("daemon returned malformed units")?;
            print_units(&units);
            println!("Review, then run 'fleet deploy start'.");
        }
        DeployCommand::Toggle { index, enabled } => {
            let mut req = DaemonRequest::new("toggle");
            req.index = Some(index);
            req.enabled = Some(enabled);
            call(&home, &req)?;
            println!(
                "✓ Unit {index} {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        DeployCommand::Start => {
            call(&home, &DaemonRequest::new("start"))?;
            println!("✓ Deployment started; follow it with 'fleet deploy watch'.");
        }
        DeployCommand::Stop => {
            call(&home, &DaemonRequest::new("stop"))?;
            println!("✓ Deployment will stop after the running unit.");
        }
        DeployCommand::Cancel => {
            call(&home, &DaemonRequest::new("cancel"))?;
            println!("✓ Plan discarded.");
        }
        DeployCommand::Status { json } => status(&home, json)?,
        DeployCommand::Diff { index } => {
            let mut req = DaemonRequest::new("diff");
            req.index = Some(index);
            let data = call(&home, &req)?;
            let diff = data["diff"].as_str().unwrap_or_default();
            if diff.is_empty() {
                println!("Unit {index} content is unchanged.");
            } else {
                print!("{diff}");
            }
        }
        DeployCommand::Watch => watch(&home)?,
    }

    Ok(())
}

fn call(home: &Path, req: &DaemonRequest) -> Result<Value> {
    request(home, req).map_err(|err| match err {
        DaemonError::DaemonNotRunning { .. } => {
            anyhow!("daemon is not running; start it with 'fleet daemon start'")
        }
        other => anyhow::Error::new(other).context(format!("'{}' failed", req.cmd)),
    })
}

fn status(home: &Path, json: bool) -> Result<()> {
    let status = call(home, &DaemonRequest::new("status"))?;
    let units = call(home, &DaemonRequest::new("units"))?;

    if json {
        let payload = serde_json::json!({
            "deployment": status["deployment"],
            "units": units,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to render status JSON")?
        );
        return Ok(());
    }

    let deployment = &status["deployment"];
    println!(
        "Deployment: {}",
        deployment["status"].as_str().unwrap_or("unknown").bold()
    );
    if let Some(message) = deployment["message"].as_str().filter(|m| !m.is_empty()) {
        println!("{}", message.yellow());
    }
    let units: Vec<UnitView> =
        serde_json::from_value(units).context("daemon returned malformed units")?;
    print_units(&units);
    Ok(())
}

fn watch(home: &Path) -> Result<()> {
    let (snapshot, events) = open_stream(home, &DaemonRequest::new("subscribe")).map_err(|err| {
        match err {
            DaemonError::DaemonNotRunning { .. } => {
                anyhow!("daemon is not running; start it with 'fleet daemon start'")
            }
            other => anyhow::Error::new(other).context("subscribe failed"),
        }
    })?;

    println!(
        "Deployment: {}",
        snapshot["status"].as_str().unwrap_or("unknown").bold()
    );
    for line in snapshot["log"].as_array().into_iter().flatten() {
        println!("{}", line.as_str().unwrap_or_default().trim_end());
    }

    for event in events {
        let event: DeploymentEvent =
            serde_json::from_value(event.context("event stream failed")?)
                .context("daemon sent a malformed event")?;
        match event {
            DeploymentEvent::StatusChanged { status } => {
                println!("{} {}", "status:".bright_black(), status.to_string().bold());
            }
            DeploymentEvent::MessageChanged { message } if !message.is_empty() => {
                println!("{}", message.yellow());
            }
            DeploymentEvent::MessageChanged { .. } | DeploymentEvent::LogCleared => {}
            DeploymentEvent::UnitsReplaced { units } => {
                println!("{} {} unit(s)", "plan:".bright_black(), units.len());
            }
            DeploymentEvent::UnitChanged { unit } => {
                println!(
                    "[{}] {} {} {}",
                    unit.index,
                    unit.host,
                    unit.name,
                    status_label(unit.status)
                );
            }
            DeploymentEvent::LogAppended { line } => println!("{}", line.trim_end()),
            DeploymentEvent::Resync { skipped, snapshot } => {
                println!(
                    "{} missed {skipped} event(s); current state follows",
                    "resync:".yellow()
                );
                println!("Deployment: {}", snapshot.status.to_string().bold());
                print_units(&snapshot.units);
            }
        }
    }
    Ok(())
}

fn print_units(units: &[UnitView]) {
    if units.is_empty() {
        println!("No units.");
        return;
    }
    let rows: Vec<UnitRow> = units
        .iter()
        .map(|unit| UnitRow {
            index: unit.index,
            enabled: if unit.enabled { "✓" } else { "-" }.to_string(),
            host: unit.host.clone(),
            class: unit.class.to_string(),
            name: unit.name.clone(),
            action: action_label(unit.action).to_string(),
            status: status_label(unit.status).to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}
