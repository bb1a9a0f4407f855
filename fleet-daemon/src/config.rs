//! Daemon configuration loaded from `~/.fleet/daemon.yaml`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, DaemonError};
use crate::paths::{config_path, scripts_dir};

pub const DEFAULT_AGENT_LISTEN: &str = "0.0.0.0:8888";
pub const DEFAULT_INTERPRETER: &str = "/usr/bin/python3";
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Every field is optional in the file; missing ones take the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
struct RawConfig {
    agent_listen: Option<String>,
    scripts_dir: Option<PathBuf>,
    interpreter: Option<String>,
    event_buffer: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonConfig {
    /// Address host agents connect to.
    pub agent_listen: String,
    /// Directory holding `<class>.py` deploy scripts and `log.py`.
    pub scripts_dir: PathBuf,
    /// Interpreter the agent runs scripts with.
    pub interpreter: String,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl DaemonConfig {
    pub fn defaults_at(home: &Path) -> Self {
        Self {
            agent_listen: DEFAULT_AGENT_LISTEN.to_string(),
            scripts_dir: scripts_dir(home),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Load `daemon.yaml` under `home`, falling back to defaults when absent.
    pub fn load_at(home: &Path) -> Result<Self, DaemonError> {
        let path = config_path(home);
        let raw = match std::fs::read_to_string(&path) {
            Ok(text) => serde_yaml::from_str::<RawConfig>(&text).map_err(|source| {
                DaemonError::Yaml {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(err) if err.kind() == ErrorKind::NotFound => RawConfig::default(),
            Err(err) => return Err(io_err(&path, err)),
        };

        let defaults = Self::defaults_at(home);
        Ok(Self {
            agent_listen: raw.agent_listen.unwrap_or(defaults.agent_listen),
            scripts_dir: raw.scripts_dir.unwrap_or(defaults.scripts_dir),
            interpreter: raw.interpreter.unwrap_or(defaults.interpreter),
            event_buffer: raw.event_buffer.unwrap_or(defaults.event_buffer).max(1),
        })
    }
}
