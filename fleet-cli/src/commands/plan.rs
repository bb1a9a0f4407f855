//! `fleet plan [target]`: offline preview of what a deployment would do.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use fleet_core::{FileStore, ObjectId};
use fleet_plan::{unit_diff, DeploymentUnit, PlanError, UnitView};

use super::{action_label, home_dir};

/// Arguments for `fleet plan`.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Restrict the plan to what is reachable from this object id.
    pub target: Option<i64>,

    /// Print a unified diff of every unit's content.
    #[arg(long)]
    pub diff: bool,

    /// Emit machine-readable JSON.
    #[arg(long, conflicts_with = "diff")]
    pub json: bool,
}

#[derive(Tabled)]
struct UnitRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "host")]
    host: String,
    #[tabled(rename = "class")]
    class: String,
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "action")]
    action: String,
    #[tabled(rename = "state")]
    state: String,
}

impl PlanArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let store = FileStore::open_at(&home).context("failed to open fleet store")?;

        let units = match fleet_plan::plan(&store, self.target.map(ObjectId)) {
            Ok(units) => units,
            Err(PlanError::InvalidTree(errors)) => {
                for err in &errors.0 {
                    eprintln!("{} {err}", "✗".red().bold());
                }
                anyhow::bail!("object tree is invalid ({} error(s))", errors.0.len());
            }
            Err(err) => return Err(err).context("planning failed"),
        };

        if self.json {
            let views: Vec<UnitView> = units.iter().map(DeploymentUnit::view).collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&views).context("failed to serialize plan JSON")?
            );
            return Ok(());
        }

        if units.is_empty() {
            println!("Nothing to deploy.");
            return Ok(());
        }

        print_units(&units);
        if self.diff {
            for unit in &units {
                let diff = unit_diff(unit)
                    .with_context(|| format!("failed to diff unit {}", unit.index))?;
                print!("{diff}");
                if !diff.is_empty() && !diff.ends_with('\n') {
                    println!();
                }
            }
        }
        Ok(())
    }
}

fn print_units(units: &[DeploymentUnit]) {
    let rows: Vec<UnitRow> = units
        .iter()
        .map(|unit| UnitRow {
            index: unit.index,
            host: unit.host_name.clone(),
            class: unit.class.to_string(),
            name: unit.name.clone(),
            action: action_label(unit.action).to_string(),
            state: if unit.content_changed() {
                "changed".to_string()
            } else {
                "unchanged".bright_black().to_string()
            },
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}
