use std::path::{Path, PathBuf};

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const DAEMON_CONFIG: &str = "daemon.yaml";

pub fn fleet_root(home: &Path) -> PathBuf {
    fleet_core::store::fleet_root(home)
}

pub fn socket_path(home: &Path) -> PathBuf {
    fleet_root(home).join(DAEMON_SOCKET)
}

pub fn config_path(home: &Path) -> PathBuf {
    fleet_root(home).join(DAEMON_CONFIG)
}

pub fn scripts_dir(home: &Path) -> PathBuf {
    fleet_root(home).join("scripts")
}
