pub mod daemon;
pub mod deploy;
pub mod host;
pub mod init;
pub mod object;
pub mod plan;

use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};

use fleet_plan::{UnitAction, UnitStatus};

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub(crate) fn action_label(action: UnitAction) -> ColoredString {
    let label = action.to_string();
    match action {
        UnitAction::Add => label.green(),
        UnitAction::Modify => label.yellow(),
        UnitAction::Remove => label.red(),
        UnitAction::Trigger => label.cyan(),
    }
}

pub(crate) fn status_label(status: UnitStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        UnitStatus::Normal => label.normal(),
        UnitStatus::Deploying => label.blue().bold(),
        UnitStatus::Success => label.green(),
        UnitStatus::Failure => label.red().bold(),
    }
}
