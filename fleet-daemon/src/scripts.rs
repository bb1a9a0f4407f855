//! Host-side scripts shipped with every job.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fleet_core::ObjectClass;

use crate::error::{io_err, DaemonError};

pub const LOG_SCRIPT: &str = "log.py";

/// File name of the deploy script for `class`.
pub fn deploy_script_name(class: ObjectClass) -> String {
    format!("{}.py", class.as_str())
}

/// Directory of `<class>.py` deploy scripts plus `log.py`.
#[derive(Debug, Clone)]
pub struct ScriptCatalog {
    dir: PathBuf,
}

impl ScriptCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Body of the deploy script for `class`, `None` if there is none.
    pub async fn deploy_script(&self, class: ObjectClass) -> Result<Option<String>, DaemonError> {
        self.load(&deploy_script_name(class)).await
    }

    pub async fn log_script(&self) -> Result<Option<String>, DaemonError> {
        self.load(LOG_SCRIPT).await
    }

    async fn load(&self, name: &str) -> Result<Option<String>, DaemonError> {
        let path = self.dir.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(&path, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn loads_class_scripts_and_reports_missing() {
        let dir = TempDir::new().expect("dir");
        std::fs::write(dir.path().join("firewall-rule.py"), "import sys\n").expect("write");
        let catalog = ScriptCatalog::new(dir.path());

        let body = catalog
            .deploy_script(ObjectClass::FirewallRule)
            .await
            .expect("load");
        assert_eq!(body.as_deref(), Some("import sys\n"));
        assert_eq!(catalog.deploy_script(ObjectClass::User).await.expect("load"), None);
        assert_eq!(catalog.log_script().await.expect("load"), None);
    }
}
