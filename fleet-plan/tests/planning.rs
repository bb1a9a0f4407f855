//! End-to-end planning tests over an in-memory store.

use std::collections::HashMap;

use chrono::Utc;
use fleet_core::{
    types::{
        CollectionContent, FileContent, GroupContent, HostContent, PackageContent, RootContent,
        UserContent,
    },
    ConfigObject, DeployedUnit, MemoryStore, ObjectClass, ObjectContent, ObjectDraft, ObjectId,
    ObjectStore, SavedVersion, StoreError, Variable,
};
use rstest::rstest;

use fleet_plan::{
    build, index_objects, order, plan, DeploymentUnit, PlanError, UnitAction, UnitStatus,
    ValidationError,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ids(ids: &[i64]) -> Vec<ObjectId> {
    ids.iter().copied().map(ObjectId).collect()
}

fn obj(id: i64, name: &str, content: ObjectContent) -> ConfigObject {
    ConfigObject {
        id: ObjectId(id),
        version: 1,
        name: name.to_string(),
        catagory: String::new(),
        comment: String::new(),
        content,
        saved_at: Utc::now(),
    }
}

fn root() -> ConfigObject {
    obj(
        1,
        "root",
        ObjectContent::Root(RootContent {
            variables: vec![Variable::new("domain", "example.com")],
        }),
    )
}

fn host(id: i64, name: &str, contains: &[i64]) -> ConfigObject {
    obj(
        id,
        name,
        ObjectContent::Host(HostContent {
            contains: ids(contains),
            ..HostContent::default()
        }),
    )
}

fn user(id: i64, name: &str, contains: &[i64]) -> ConfigObject {
    obj(
        id,
        name,
        ObjectContent::User(UserContent {
            contains: ids(contains),
            ..UserContent::default()
        }),
    )
}

fn file(id: i64, name: &str, path: &str, depends: &[i64]) -> ConfigObject {
    obj(
        id,
        name,
        ObjectContent::File(FileContent {
            path: path.to_string(),
            data: "managed by fleet on {{hostname}}\n".to_string(),
            depends: ids(depends),
            ..FileContent::default()
        }),
    )
}

fn package(id: i64, name: &str) -> ConfigObject {
    obj(
        id,
        name,
        ObjectContent::Package(PackageContent {
            name: Some(name.to_string()),
            depends: vec![],
        }),
    )
}

fn collection(id: i64, name: &str, contains: &[i64], variables: Vec<Variable>) -> ConfigObject {
    obj(
        id,
        name,
        ObjectContent::Collection(CollectionContent {
            contains: ids(contains),
            depends: vec![],
            variables,
        }),
    )
}

/// Two hosts, users with a shared file, a variable-scoped collection and a
/// file that depends on a package.
fn fleet() -> Vec<ConfigObject> {
    vec![
        root(),
        host(2, "web1", &[10, 11, 30, 50]),
        host(3, "db1", &[10, 40]),
        user(10, "alice", &[20]),
        user(11, "bob", &[20]),
        file(20, "bashrc", "/home/{{user}}/.bashrc", &[]),
        collection(30, "nginx-site", &[21], vec![Variable::new("port", "8080")]),
        file(21, "site.conf", "/etc/nginx/sites/{{port}}.conf", &[40]),
        package(40, "nginx"),
        obj(
            50,
            "staff",
            ObjectContent::Group(GroupContent::default()),
        ),
    ]
}

fn by_name<'a>(units: &'a [DeploymentUnit], host: &str, name: &str) -> &'a DeploymentUnit {
    units
        .iter()
        .find(|u| u.host_name == host && u.name == name)
        .unwrap_or_else(|| panic!("no unit {name} on {host}"))
}

fn deployed(host: i64, key: &str, class: ObjectClass, title: &str, content: ObjectContent) -> DeployedUnit {
    DeployedUnit {
        host: ObjectId(host),
        name: key.to_string(),
        class,
        title: title.to_string(),
        content,
        deployed_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[test]
fn order_respects_every_edge() {
    init_logging();
    let objects = index_objects(fleet());
    let built = build(&objects);
    assert!(built.is_valid(), "{:?}", built.errors);
    let ordered = order(&built.graph, None).expect("order");
    assert_eq!(ordered.len(), built.graph.len());

    let position: HashMap<usize, usize> =
        ordered.iter().enumerate().map(|(pos, idx)| (*idx, pos)).collect();
    for (idx, node) in built.graph.nodes() {
        for next in &node.next {
            assert!(
                position[&idx] < position[next],
                "{} must precede {}",
                node.key,
                built.graph.node(*next).key
            );
        }
    }
}

#[test]
fn units_are_indexed_in_execution_order() {
    init_logging();
    let store = MemoryStore::with_objects(fleet());
    let units = plan(&store, None).expect("plan");

    let indices: Vec<usize> = units.iter().map(|u| u.index).collect();
    assert_eq!(indices, (0..units.len()).collect::<Vec<_>>());
    assert!(units.iter().all(|u| !u.class.is_structural()));

    let pkg = by_name(&units, "web1", "nginx");
    let conf = by_name(&units, "web1", "site.conf");
    assert!(pkg.index < conf.index, "dependency runs first");

    let alice = by_name(&units, "web1", "alice");
    let group = by_name(&units, "web1", "staff");
    assert!(group.index < alice.index, "groups before users");

    let last_web1 = units.iter().filter(|u| u.host_name == "web1").map(|u| u.index).max();
    let first_db1 = units.iter().filter(|u| u.host_name == "db1").map(|u| u.index).min();
    assert!(last_web1 < first_db1, "hosts are ordered by id");
}

#[test]
fn planning_twice_is_byte_identical() {
    let store = MemoryStore::with_objects(fleet());
    let first = serde_json::to_string(&plan(&store, None).expect("plan")).expect("json");
    let second = serde_json::to_string(&plan(&store, None).expect("plan")).expect("json");
    assert_eq!(first, second);
}

#[test]
fn targeted_plan_covers_only_reachable_units() {
    let store = MemoryStore::with_objects(fleet());
    let units = plan(&store, Some(ObjectId(10))).expect("plan");
    let names: Vec<(&str, &str)> = units
        .iter()
        .map(|u| (u.host_name.as_str(), u.name.as_str()))
        .collect();
    assert_eq!(
        names,
        vec![
            ("web1", "alice"),
            ("web1", "bashrc"),
            ("db1", "alice"),
            ("db1", "bashrc"),
        ]
    );
}

// ---------------------------------------------------------------------------
// Scopes and templates
// ---------------------------------------------------------------------------

#[test]
fn shared_file_is_templated_per_user() {
    let store = MemoryStore::with_objects(fleet());
    let units = plan(&store, None).expect("plan");
    let paths: Vec<(String, String)> = units
        .iter()
        .filter(|u| u.host_name == "web1" && u.name == "bashrc")
        .filter_map(|u| match &u.next {
            Some(ObjectContent::File(f)) => Some((f.path.clone(), f.user.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        paths,
        vec![
            ("/home/alice/.bashrc".to_string(), "alice".to_string()),
            ("/home/bob/.bashrc".to_string(), "bob".to_string()),
        ]
    );
}

#[test]
fn collection_variables_reach_contained_files() {
    let store = MemoryStore::with_objects(fleet());
    let units = plan(&store, None).expect("plan");
    let conf = by_name(&units, "web1", "site.conf");
    match &conf.next {
        Some(ObjectContent::File(f)) => {
            assert_eq!(f.path, "/etc/nginx/sites/8080.conf");
            assert_eq!(f.data, "managed by fleet on web1\n");
            assert_eq!(f.user, "root");
            assert_eq!(f.group, "root");
        }
        other => panic!("unexpected content: {other:?}"),
    }
    assert_eq!(conf.key, "2.30.21");
    assert_eq!(conf.variables.get("domain"), Some("example.com"));
}

#[test]
fn user_unit_carries_its_login_name() {
    let store = MemoryStore::with_objects(fleet());
    let units = plan(&store, None).expect("plan");
    match &by_name(&units, "db1", "alice").next {
        Some(ObjectContent::User(u)) => assert_eq!(u.name.as_deref(), Some("alice")),
        other => panic!("unexpected content: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn transitive_self_containment_is_invalid() {
    let store = MemoryStore::with_objects([
        root(),
        host(2, "web1", &[30]),
        collection(30, "outer", &[31], vec![]),
        collection(31, "inner", &[30], vec![]),
    ]);
    let err = plan(&store, None).unwrap_err();
    assert!(matches!(err, PlanError::InvalidTree(_)), "got: {err}");
    assert_eq!(
        err.validation_errors(),
        &[ValidationError::ContainmentCycle {
            parent: "inner".into(),
            object: "outer".into(),
        }]
    );
}

#[test]
fn package_directly_inside_user_is_invalid() {
    let store = MemoryStore::with_objects([
        root(),
        host(2, "web1", &[10]),
        user(10, "alice", &[40]),
        package(40, "vim"),
    ]);
    let err = plan(&store, None).unwrap_err();
    assert_eq!(
        err.validation_errors(),
        &[ValidationError::ScopeViolation {
            object: "vim".into(),
            class: ObjectClass::Package,
            user: "alice".into(),
        }]
    );
    assert_eq!(
        err.to_string(),
        "vim of class package is contained in user alice, but only files and collections are allowed"
    );
}

#[rstest]
#[case::file(file(40, "motd", "/home/{{user}}/motd", &[]), true)]
#[case::collection(collection(40, "dotfiles", &[], vec![]), true)]
#[case::package(package(40, "vim"), false)]
#[case::group(obj(40, "staff", ObjectContent::Group(GroupContent::default())), false)]
fn only_files_and_collections_fit_inside_users(#[case] member: ConfigObject, #[case] allowed: bool) {
    let store = MemoryStore::with_objects([
        root(),
        host(2, "web1", &[10]),
        user(10, "alice", &[40]),
        member,
    ]);
    assert_eq!(plan(&store, None).is_ok(), allowed);
}

#[test]
fn all_errors_are_collected() {
    let store = MemoryStore::with_objects([
        root(),
        host(2, "web1", &[10, 99]),
        user(10, "alice", &[40]),
        package(40, "vim"),
    ]);
    let err = plan(&store, None).unwrap_err();
    assert_eq!(err.validation_errors().len(), 2);
    assert_eq!(err.to_string().lines().count(), 2);
}

// ---------------------------------------------------------------------------
// Diffing
// ---------------------------------------------------------------------------

#[test]
fn unchanged_unit_is_modify_and_missing_unit_is_removed() {
    let a = package(40, "nginx");
    let store = MemoryStore::with_objects([root(), host(2, "web1", &[40]), a.clone()]).with_deployed([
        deployed(2, "2.40", ObjectClass::Package, "nginx", a.content.clone()),
        deployed(
            2,
            "2.41",
            ObjectClass::Package,
            "apache2",
            package(41, "apache2").content,
        ),
    ]);

    let units = plan(&store, None).expect("plan");
    assert_eq!(units.len(), 2);

    assert_eq!(units[0].action, UnitAction::Modify);
    assert_eq!(units[0].prev, units[0].next);
    assert!(!units[0].content_changed());

    assert_eq!(units[1].action, UnitAction::Remove);
    assert_eq!(units[1].name, "apache2");
    assert_eq!(units[1].key, "2.41");
    assert!(units[1].next.is_none());
    assert!(units[1].object.is_none());
    assert_eq!(units[1].status, UnitStatus::Normal);
}

#[test]
fn removals_run_in_reverse_creation_order() {
    let store = MemoryStore::with_objects([root(), host(2, "web1", &[])]).with_deployed([
        deployed(2, "2.10", ObjectClass::User, "alice", user(10, "alice", &[]).content),
        deployed(2, "2.40", ObjectClass::Package, "nginx", package(40, "nginx").content),
        deployed(2, "2.10.20", ObjectClass::File, "bashrc", file(20, "bashrc", "/x", &[]).content),
        deployed(2, "2.41", ObjectClass::Package, "curl", package(41, "curl").content),
    ]);

    let units = plan(&store, None).expect("plan");
    let order: Vec<&str> = units.iter().map(|u| u.key.as_str()).collect();
    assert_eq!(order, vec!["2.40", "2.41", "2.10.20", "2.10"]);
    assert!(units.iter().all(|u| u.action == UnitAction::Remove));
}

#[test]
fn targeted_plan_never_removes() {
    let store = MemoryStore::with_objects(fleet()).with_deployed([deployed(
        2,
        "2.99",
        ObjectClass::Package,
        "old",
        package(99, "old").content,
    )]);
    let units = plan(&store, Some(ObjectId(40))).expect("plan");
    assert!(units.iter().all(|u| u.action != UnitAction::Remove));
}

// ---------------------------------------------------------------------------
// Store failures
// ---------------------------------------------------------------------------

struct BrokenStore;

impl ObjectStore for BrokenStore {
    fn list_newest_objects(&self) -> Result<Vec<ConfigObject>, StoreError> {
        Err(StoreError::HomeNotFound)
    }
    fn object_history(&self, id: ObjectId) -> Result<Vec<ConfigObject>, StoreError> {
        Err(StoreError::ObjectNotFound { id })
    }
    fn last_deployed(&self, _host: Option<ObjectId>) -> Result<Vec<DeployedUnit>, StoreError> {
        Err(StoreError::HomeNotFound)
    }
    fn save_version(&self, _id: ObjectId, _draft: ObjectDraft) -> Result<SavedVersion, StoreError> {
        Err(StoreError::HomeNotFound)
    }
    fn record_deployed(
        &self,
        _host: ObjectId,
        _name: &str,
        _unit: Option<DeployedUnit>,
    ) -> Result<(), StoreError> {
        Err(StoreError::HomeNotFound)
    }
}

#[test]
fn store_failure_is_propagated() {
    let err = plan(&BrokenStore, None).unwrap_err();
    assert!(matches!(err, PlanError::Store(StoreError::HomeNotFound)), "got: {err}");
}
