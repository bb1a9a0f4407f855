//! Deployment units: the flattened, orderable, toggleable work items.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use fleet_core::{ObjectClass, ObjectContent, ObjectId};
use fleet_renderer::TemplateContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UnitStatus {
    #[default]
    Normal,
    Deploying,
    Success,
    Failure,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitStatus::Normal => "normal",
            UnitStatus::Deploying => "deploying",
            UnitStatus::Success => "success",
            UnitStatus::Failure => "failure",
        };
        f.write_str(label)
    }
}

/// What executing a unit does to its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitAction {
    Add,
    Modify,
    Remove,
    /// Side-effect only run; the differ never emits it on its own.
    Trigger,
}

impl fmt::Display for UnitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitAction::Add => "add",
            UnitAction::Modify => "modify",
            UnitAction::Remove => "remove",
            UnitAction::Trigger => "trigger",
        };
        f.write_str(label)
    }
}

/// One piece of work in a deployment run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentUnit {
    /// Position in execution order; gap-free from 0.
    pub index: usize,
    pub class: ObjectClass,
    pub host: ObjectId,
    pub host_name: String,
    /// Display name: the object name, or the last-deployed title for removals.
    pub name: String,
    /// Composite plan key; matched against last-deployed entries.
    pub key: String,
    /// Source object. `None` for removals.
    pub object: Option<ObjectId>,
    pub enabled: bool,
    pub status: UnitStatus,
    pub action: UnitAction,
    /// Last-deployed content; `None` for additions.
    pub prev: Option<ObjectContent>,
    /// Desired content after templating; `None` for removals.
    pub next: Option<ObjectContent>,
    pub variables: TemplateContext,
}

impl DeploymentUnit {
    /// `false` for a Modify whose desired content equals what is deployed.
    pub fn content_changed(&self) -> bool {
        self.prev != self.next
    }

    pub fn view(&self) -> UnitView {
        UnitView {
            index: self.index,
            class: self.class,
            host: self.host_name.clone(),
            name: self.name.clone(),
            enabled: self.enabled,
            status: self.status,
            action: self.action,
        }
    }
}

/// Publishable projection of a [`DeploymentUnit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitView {
    pub index: usize,
    pub class: ObjectClass,
    pub host: String,
    pub name: String,
    pub enabled: bool,
    pub status: UnitStatus,
    pub action: UnitAction,
}

/// SHA-256 hex digest of the canonical JSON encoding of `content`.
pub fn content_digest(content: &ObjectContent) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(content)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use fleet_core::types::PackageContent;

    use super::*;

    fn package(name: &str) -> ObjectContent {
        ObjectContent::Package(PackageContent {
            name: Some(name.to_string()),
            depends: vec![],
        })
    }

    fn unit(prev: Option<ObjectContent>, next: Option<ObjectContent>) -> DeploymentUnit {
        DeploymentUnit {
            index: 0,
            class: ObjectClass::Package,
            host: ObjectId(2),
            host_name: "web1".into(),
            name: "nginx".into(),
            key: "2.40".into(),
            object: Some(ObjectId(40)),
            enabled: true,
            status: UnitStatus::Normal,
            action: UnitAction::Modify,
            prev,
            next,
            variables: TemplateContext::new(),
        }
    }

    #[test]
    fn identical_modify_reports_no_change() {
        assert!(!unit(Some(package("nginx")), Some(package("nginx"))).content_changed());
        assert!(unit(Some(package("nginx")), Some(package("nginx-full"))).content_changed());
        assert!(unit(None, Some(package("nginx"))).content_changed());
    }

    #[test]
    fn digest_is_stable_hex() {
        let a = content_digest(&package("nginx")).expect("digest");
        let b = content_digest(&package("nginx")).expect("digest");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_digest(&package("apache2")).expect("digest"));
    }

    #[test]
    fn view_uses_host_name() {
        let view = unit(None, Some(package("nginx"))).view();
        assert_eq!(view.host, "web1");
        assert_eq!(view.status, UnitStatus::Normal);
        let json = serde_json::to_string(&view).expect("json");
        assert!(json.contains(r#""action":"modify""#), "got: {json}");
    }
}
