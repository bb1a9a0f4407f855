//! Versioned object store.
//!
//! # Storage layout
//!
//! ```text
//! ~/.fleet/
//!   objects/
//!     <id>.yaml        (every version of one object, mode 0600)
//!   deployed/
//!     <host>.yaml      (last-deployed units of one host, keyed by plan key)
//! ```
//!
//! # API pattern
//!
//! Filesystem entry points come in two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{
    ConfigObject, DeployedUnit, ObjectContent, ObjectDraft, ObjectId, RootContent, SavedVersion,
};

/// Lowest id handed out to objects created through the store.
pub const FIRST_OBJECT_ID: i64 = 10_000;

/// Id of the root object seeded by [`FileStore::init_at`].
pub const ROOT_ID: ObjectId = ObjectId(1);

// ---------------------------------------------------------------------------
// 1. Collaborator contract
// ---------------------------------------------------------------------------

/// Persistence boundary used by planning and execution.
///
/// Implementations guarantee exactly one newest version per id and strictly
/// increasing versions starting at 1.
pub trait ObjectStore: Send + Sync {
    /// Newest version of every object, sorted by id.
    fn list_newest_objects(&self) -> Result<Vec<ConfigObject>, StoreError>;

    /// Every stored version of `id`, oldest first.
    fn object_history(&self, id: ObjectId) -> Result<Vec<ConfigObject>, StoreError>;

    /// Last-deployed units, optionally restricted to one host, sorted by
    /// `(host, name)`.
    fn last_deployed(&self, host: Option<ObjectId>) -> Result<Vec<DeployedUnit>, StoreError>;

    /// Persist a new version. A negative `id` allocates a fresh object.
    fn save_version(&self, id: ObjectId, draft: ObjectDraft) -> Result<SavedVersion, StoreError>;

    /// Replace (`Some`) or delete (`None`) one last-deployed entry.
    fn record_deployed(
        &self,
        host: ObjectId,
        name: &str,
        unit: Option<DeployedUnit>,
    ) -> Result<(), StoreError>;
}

/// Build the next version of an object from its history.
fn next_version(
    history: &[ConfigObject],
    id: ObjectId,
    draft: ObjectDraft,
) -> Result<ConfigObject, StoreError> {
    let newest = history
        .iter()
        .max_by_key(|o| o.version)
        .ok_or(StoreError::ObjectNotFound { id })?;
    if newest.class() != draft.content.class() {
        return Err(StoreError::ClassMismatch {
            id,
            existing: newest.class(),
            requested: draft.content.class(),
        });
    }
    Ok(materialize(id, newest.version + 1, draft))
}

fn materialize(id: ObjectId, version: u32, draft: ObjectDraft) -> ConfigObject {
    ConfigObject {
        id,
        version,
        name: draft.name,
        catagory: draft.catagory,
        comment: draft.comment,
        content: draft.content,
        saved_at: Utc::now(),
    }
}

fn allocate_id(max_existing: Option<ObjectId>) -> ObjectId {
    let next = max_existing.map(|id| id.0 + 1).unwrap_or(FIRST_OBJECT_ID);
    ObjectId(next.max(FIRST_OBJECT_ID))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// 2. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.fleet/`
pub fn fleet_root(home: &Path) -> PathBuf {
    home.join(".fleet")
}

/// `<home>/.fleet/objects/<id>.yaml`: pure, no I/O.
pub fn object_path_at(home: &Path, id: ObjectId) -> PathBuf {
    fleet_root(home).join("objects").join(format!("{id}.yaml"))
}

/// `<home>/.fleet/deployed/<host>.yaml`: pure, no I/O.
pub fn deployed_path_at(home: &Path, host: ObjectId) -> PathBuf {
    fleet_root(home).join("deployed").join(format!("{host}.yaml"))
}

// ---------------------------------------------------------------------------
// 3. File store
// ---------------------------------------------------------------------------

/// On-disk history of a single object.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectHistory {
    id: ObjectId,
    versions: Vec<ConfigObject>,
}

/// On-disk last-deployed set of a single host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HostDeployments {
    #[serde(default)]
    units: BTreeMap<String, DeployedUnit>,
}

/// YAML-backed [`ObjectStore`] rooted at `<home>/.fleet/`.
///
/// The read-max-then-insert path of a version bump runs under a per-id lock,
/// and fresh id allocation under a store-wide lock, so concurrent writers
/// cannot produce two newest versions.
pub struct FileStore {
    home: PathBuf,
    id_locks: Mutex<HashMap<ObjectId, Arc<Mutex<()>>>>,
    alloc_lock: Mutex<()>,
    deployed_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating directories if needed) the store under `home`.
    pub fn open_at(home: &Path) -> Result<Self, StoreError> {
        for dir in [
            fleet_root(home),
            fleet_root(home).join("objects"),
            fleet_root(home).join("deployed"),
        ] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
                set_dir_permissions(&dir)?;
            }
        }
        Ok(Self {
            home: home.to_path_buf(),
            id_locks: Mutex::new(HashMap::new()),
            alloc_lock: Mutex::new(()),
            deployed_lock: Mutex::new(()),
        })
    }

    /// `open_at` convenience wrapper.
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(&home()?)
    }

    /// Open the store and seed the root object if the store is empty.
    ///
    /// Idempotent: an existing store is returned unchanged.
    pub fn init_at(home: &Path) -> Result<Self, StoreError> {
        let store = Self::open_at(home)?;
        if store.object_ids()?.is_empty() {
            let root = materialize(
                ROOT_ID,
                1,
                ObjectDraft {
                    name: "root".to_string(),
                    catagory: String::new(),
                    comment: "Fleet root".to_string(),
                    content: ObjectContent::Root(RootContent::default()),
                },
            );
            write_yaml_atomic(
                &object_path_at(home, ROOT_ID),
                &ObjectHistory {
                    id: ROOT_ID,
                    versions: vec![root],
                },
            )?;
            tracing::info!(home = %home.display(), "seeded fleet store with root object");
        }
        Ok(store)
    }

    /// `init_at` convenience wrapper.
    pub fn init() -> Result<Self, StoreError> {
        Self::init_at(&home()?)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn lock_for(&self, id: ObjectId) -> Arc<Mutex<()>> {
        lock(&self.id_locks).entry(id).or_default().clone()
    }

    fn object_ids(&self) -> Result<Vec<ObjectId>, StoreError> {
        let dir = fleet_root(&self.home).join("objects");
        let mut ids: Vec<ObjectId> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".yaml")?.parse::<i64>().ok()
            })
            .map(ObjectId)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn load_history(&self, id: ObjectId) -> Result<Option<ObjectHistory>, StoreError> {
        read_yaml(&object_path_at(&self.home, id))
    }

    fn load_host(&self, host: ObjectId) -> Result<HostDeployments, StoreError> {
        Ok(read_yaml(&deployed_path_at(&self.home, host))?.unwrap_or_default())
    }

    fn deployed_hosts(&self) -> Result<Vec<ObjectId>, StoreError> {
        let dir = fleet_root(&self.home).join("deployed");
        let mut hosts: Vec<ObjectId> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".yaml")?.parse::<i64>().ok()
            })
            .map(ObjectId)
            .collect();
        hosts.sort();
        Ok(hosts)
    }
}

impl ObjectStore for FileStore {
    fn list_newest_objects(&self) -> Result<Vec<ConfigObject>, StoreError> {
        let mut newest = Vec::new();
        for id in self.object_ids()? {
            if let Some(history) = self.load_history(id)? {
                if let Some(object) = history.versions.into_iter().max_by_key(|o| o.version) {
                    newest.push(object);
                }
            }
        }
        Ok(newest)
    }

    fn object_history(&self, id: ObjectId) -> Result<Vec<ConfigObject>, StoreError> {
        let mut versions = self
            .load_history(id)?
            .ok_or(StoreError::ObjectNotFound { id })?
            .versions;
        versions.sort_by_key(|o| o.version);
        Ok(versions)
    }

    fn last_deployed(&self, host: Option<ObjectId>) -> Result<Vec<DeployedUnit>, StoreError> {
        let hosts = match host {
            Some(host) => vec![host],
            None => self.deployed_hosts()?,
        };
        let mut units = Vec::new();
        for host in hosts {
            units.extend(self.load_host(host)?.units.into_values());
        }
        Ok(units)
    }

    fn save_version(&self, id: ObjectId, draft: ObjectDraft) -> Result<SavedVersion, StoreError> {
        if id.is_new() {
            let _alloc = lock(&self.alloc_lock);
            let id = allocate_id(self.object_ids()?.last().copied());
            let object = materialize(id, 1, draft);
            write_yaml_atomic(
                &object_path_at(&self.home, id),
                &ObjectHistory {
                    id,
                    versions: vec![object],
                },
            )?;
            tracing::debug!(id = %id, "created object");
            return Ok(SavedVersion { id, version: 1 });
        }

        let id_lock = self.lock_for(id);
        let _guard = lock(id_lock.as_ref());
        let mut history = self
            .load_history(id)?
            .ok_or(StoreError::ObjectNotFound { id })?;
        let object = next_version(&history.versions, id, draft)?;
        let version = object.version;
        history.versions.push(object);
        write_yaml_atomic(&object_path_at(&self.home, id), &history)?;
        tracing::debug!(id = %id, version, "stored new object version");
        Ok(SavedVersion { id, version })
    }

    fn record_deployed(
        &self,
        host: ObjectId,
        name: &str,
        unit: Option<DeployedUnit>,
    ) -> Result<(), StoreError> {
        let _guard = lock(&self.deployed_lock);
        let mut deployments = self.load_host(host)?;
        match unit {
            Some(unit) => {
                deployments.units.insert(name.to_string(), unit);
            }
            None => {
                deployments.units.remove(name);
            }
        }
        write_yaml_atomic(&deployed_path_at(&self.home, host), &deployments)
    }
}

// ---------------------------------------------------------------------------
// 4. In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<ObjectId, Vec<ConfigObject>>,
    deployed: BTreeMap<(ObjectId, String), DeployedUnit>,
}

/// Mutex-guarded [`ObjectStore`] with the same semantics as [`FileStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with already-versioned objects, kept as given.
    pub fn with_objects(objects: impl IntoIterator<Item = ConfigObject>) -> Self {
        let store = Self::new();
        {
            let mut state = lock(&store.state);
            for object in objects {
                state.objects.entry(object.id).or_default().push(object);
            }
        }
        store
    }

    /// Seed last-deployed entries.
    pub fn with_deployed(self, units: impl IntoIterator<Item = DeployedUnit>) -> Self {
        {
            let mut state = lock(&self.state);
            for unit in units {
                state.deployed.insert((unit.host, unit.name.clone()), unit);
            }
        }
        self
    }
}

impl ObjectStore for MemoryStore {
    fn list_newest_objects(&self) -> Result<Vec<ConfigObject>, StoreError> {
        let state = lock(&self.state);
        Ok(state
            .objects
            .values()
            .filter_map(|versions| versions.iter().max_by_key(|o| o.version).cloned())
            .collect())
    }

    fn object_history(&self, id: ObjectId) -> Result<Vec<ConfigObject>, StoreError> {
        let state = lock(&self.state);
        let mut versions = state
            .objects
            .get(&id)
            .cloned()
            .ok_or(StoreError::ObjectNotFound { id })?;
        versions.sort_by_key(|o| o.version);
        Ok(versions)
    }

    fn last_deployed(&self, host: Option<ObjectId>) -> Result<Vec<DeployedUnit>, StoreError> {
        let state = lock(&self.state);
        Ok(state
            .deployed
            .values()
            .filter(|u| host.map_or(true, |h| u.host == h))
            .cloned()
            .collect())
    }

    fn save_version(&self, id: ObjectId, draft: ObjectDraft) -> Result<SavedVersion, StoreError> {
        let mut state = lock(&self.state);
        if id.is_new() {
            let id = allocate_id(state.objects.keys().next_back().copied());
            state.objects.insert(id, vec![materialize(id, 1, draft)]);
            return Ok(SavedVersion { id, version: 1 });
        }
        let history = state
            .objects
            .get_mut(&id)
            .ok_or(StoreError::ObjectNotFound { id })?;
        let object = next_version(history, id, draft)?;
        let version = object.version;
        history.push(object);
        Ok(SavedVersion { id, version })
    }

    fn record_deployed(
        &self,
        host: ObjectId,
        name: &str,
        unit: Option<DeployedUnit>,
    ) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let key = (host, name.to_string());
        match unit {
            Some(unit) => {
                state.deployed.insert(key, unit);
            }
            None => {
                state.deployed.remove(&key);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|e| StoreError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
fn write_yaml_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            set_dir_permissions(dir)?;
        }
    }
    let tmp_path = path.with_extension("yaml.tmp");
    let yaml = serde_yaml::to_string(value)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
