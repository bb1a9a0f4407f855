//! Domain types for the fleet object model.
//!
//! Every configuration entity is a versioned [`ConfigObject`]. Its payload is
//! the closed sum type [`ObjectContent`], tagged by class, so every access to
//! `contains` / `depends` / `variables` is an exhaustive match.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable identifier of a configuration object.
///
/// Negative ids are only meaningful as the "new object" marker passed to
/// `ObjectStore::save_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub i64);

impl ObjectId {
    /// Marker id requesting allocation of a fresh object.
    pub const NEW: ObjectId = ObjectId(-1);

    pub fn is_new(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for ObjectId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The kind of a configuration object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectClass {
    Root,
    Host,
    User,
    Group,
    File,
    Package,
    Collection,
    FirewallRule,
}

impl ObjectClass {
    /// Scheduling weight: lower weights are created first on a host.
    pub fn class_order(self) -> u32 {
        match self {
            ObjectClass::Collection => 10,
            ObjectClass::Group => 20,
            ObjectClass::User => 30,
            ObjectClass::File => 40,
            ObjectClass::Package => 50,
            ObjectClass::Root | ObjectClass::Host | ObjectClass::FirewallRule => 900,
        }
    }

    /// Structural classes shape the graph but are never deployed themselves.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            ObjectClass::Root | ObjectClass::Host | ObjectClass::Collection
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectClass::Root => "root",
            ObjectClass::Host => "host",
            ObjectClass::User => "user",
            ObjectClass::Group => "group",
            ObjectClass::File => "file",
            ObjectClass::Package => "package",
            ObjectClass::Collection => "collection",
            ObjectClass::FirewallRule => "firewall-rule",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effect requested after a file changes on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    #[default]
    None,
    RestartService,
    ReloadService,
    EnableUfw,
}

// ---------------------------------------------------------------------------
// Content payloads
// ---------------------------------------------------------------------------

/// One `key = value` pair contributed to the template scope of descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub value: String,
}

impl Variable {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RootContent {
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostContent {
    pub password: String,
    pub message_on_down: bool,
    pub important_services: Vec<String>,
    pub contains: Vec<ObjectId>,
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UserContent {
    pub first_name: String,
    pub last_name: String,
    pub system: bool,
    pub sudo: bool,
    pub admin: bool,
    pub password: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    pub groups: Vec<String>,
    pub sudo_on: Vec<ObjectId>,
    /// Login name; overwritten with the unit name when materialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub contains: Vec<ObjectId>,
    pub depends: Vec<ObjectId>,
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GroupContent {
    pub system: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileContent {
    pub path: String,
    pub user: String,
    pub group: String,
    pub mode: String,
    pub data: String,
    pub lang: String,
    pub triggers: Vec<Trigger>,
    pub depends: Vec<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PackageContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub depends: Vec<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CollectionContent {
    pub contains: Vec<ObjectId>,
    pub depends: Vec<ObjectId>,
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FirewallRuleContent {
    pub allow: String,
    pub depends: Vec<ObjectId>,
}

/// Class-tagged payload of a configuration object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "kebab-case")]
pub enum ObjectContent {
    Root(RootContent),
    Host(HostContent),
    User(UserContent),
    Group(GroupContent),
    File(FileContent),
    Package(PackageContent),
    Collection(CollectionContent),
    FirewallRule(FirewallRuleContent),
}

impl ObjectContent {
    pub fn class(&self) -> ObjectClass {
        match self {
            ObjectContent::Root(_) => ObjectClass::Root,
            ObjectContent::Host(_) => ObjectClass::Host,
            ObjectContent::User(_) => ObjectClass::User,
            ObjectContent::Group(_) => ObjectClass::Group,
            ObjectContent::File(_) => ObjectClass::File,
            ObjectContent::Package(_) => ObjectClass::Package,
            ObjectContent::Collection(_) => ObjectClass::Collection,
            ObjectContent::FirewallRule(_) => ObjectClass::FirewallRule,
        }
    }

    /// Containment edges: objects created/owned by this one.
    pub fn contains(&self) -> &[ObjectId] {
        match self {
            ObjectContent::Host(c) => &c.contains,
            ObjectContent::User(c) => &c.contains,
            ObjectContent::Collection(c) => &c.contains,
            ObjectContent::Root(_)
            | ObjectContent::Group(_)
            | ObjectContent::File(_)
            | ObjectContent::Package(_)
            | ObjectContent::FirewallRule(_) => &[],
        }
    }

    /// Dependency edges: objects that must be applied before this one.
    pub fn depends(&self) -> &[ObjectId] {
        match self {
            ObjectContent::User(c) => &c.depends,
            ObjectContent::File(c) => &c.depends,
            ObjectContent::Package(c) => &c.depends,
            ObjectContent::Collection(c) => &c.depends,
            ObjectContent::FirewallRule(c) => &c.depends,
            ObjectContent::Root(_) | ObjectContent::Host(_) | ObjectContent::Group(_) => &[],
        }
    }

    pub fn variables(&self) -> &[Variable] {
        match self {
            ObjectContent::Root(c) => &c.variables,
            ObjectContent::Host(c) => &c.variables,
            ObjectContent::User(c) => &c.variables,
            ObjectContent::Collection(c) => &c.variables,
            ObjectContent::Group(_)
            | ObjectContent::File(_)
            | ObjectContent::Package(_)
            | ObjectContent::FirewallRule(_) => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// One persisted version of a configuration object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigObject {
    pub id: ObjectId,
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub catagory: String,
    #[serde(default)]
    pub comment: String,
    pub content: ObjectContent,
    pub saved_at: DateTime<Utc>,
}

impl ConfigObject {
    pub fn class(&self) -> ObjectClass {
        self.content.class()
    }
}

/// Caller-supplied fields of a new object version; the store assigns the
/// id (for new objects), the version and the timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDraft {
    pub name: String,
    #[serde(default)]
    pub catagory: String,
    #[serde(default)]
    pub comment: String,
    pub content: ObjectContent,
}

/// Result of `ObjectStore::save_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedVersion {
    pub id: ObjectId,
    pub version: u32,
}

/// Snapshot of one unit as it was last successfully applied to a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedUnit {
    pub host: ObjectId,
    /// Composite plan key the unit was deployed under.
    pub name: String,
    pub class: ObjectClass,
    /// Display name shown to operators.
    pub title: String,
    pub content: ObjectContent,
    pub deployed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
