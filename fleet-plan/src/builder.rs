//! Plan builder: turns the newest object set into a validated [`PlanGraph`].
//!
//! Every host is walked depth-first from the synthetic root. `contains` edges
//! extend the containment path; `depends` edges are resolved from the host
//! root instead, and add a precedence edge into the depending node. Rule
//! violations are collected and never stop the walk.

use std::collections::{BTreeMap, HashSet};

use fleet_core::{ConfigObject, ObjectClass, ObjectId};
use fleet_renderer::TemplateContext;

use crate::error::ValidationError;
use crate::graph::{NodeIndex, NodeKey, PlanGraph, PlanNode};

/// Newest objects keyed by id.
pub type ObjectIndex = BTreeMap<ObjectId, ConfigObject>;

pub fn index_objects(objects: impl IntoIterator<Item = ConfigObject>) -> ObjectIndex {
    objects.into_iter().map(|o| (o.id, o)).collect()
}

/// Graph plus every validation error found while building it.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub graph: PlanGraph,
    pub errors: Vec<ValidationError>,
}

impl BuildOutput {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Build the plan graph for the whole object set.
pub fn build(objects: &ObjectIndex) -> BuildOutput {
    let root = objects
        .values()
        .find(|o| o.class() == ObjectClass::Root)
        .map(|o| o.id);

    let mut root_vars = TemplateContext::new();
    if let Some(root_obj) = root.and_then(|id| objects.get(&id)) {
        root_vars.extend_from(root_obj.content.variables());
    }

    let mut builder = Builder {
        objects,
        root,
        graph: PlanGraph::new(root, root_vars),
        errors: Vec::new(),
    };
    for host in objects.values().filter(|o| o.class() == ObjectClass::Host) {
        builder.visit_host(host);
    }

    tracing::debug!(
        "plan graph built: {} node(s), {} validation error(s)",
        builder.graph.len(),
        builder.errors.len()
    );
    BuildOutput {
        graph: builder.graph,
        errors: builder.errors,
    }
}

// ---------------------------------------------------------------------------
// Walk state
// ---------------------------------------------------------------------------

struct Builder<'a> {
    objects: &'a ObjectIndex,
    root: Option<ObjectId>,
    graph: PlanGraph,
    errors: Vec<ValidationError>,
}

/// Per-host walk state.
struct HostWalk<'a> {
    host: ObjectId,
    host_name: &'a str,
    host_node: NodeIndex,
    /// `[root, host]`: the path every top-level and dependency visit starts from.
    base_path: Vec<ObjectId>,
    /// Objects on the current walk stack, across containment and dependency hops.
    open: HashSet<ObjectId>,
}

impl<'a> Builder<'a> {
    fn visit_host(&mut self, host: &'a ConfigObject) {
        let base_path: Vec<ObjectId> = self.root.into_iter().chain([host.id]).collect();
        let variables = self.scope_variables(&base_path);
        let host_node = self.graph.insert(PlanNode {
            key: NodeKey::from_path(&[host.id]),
            object: Some(host.id),
            class: ObjectClass::Host,
            host: Some(host.id),
            next: Vec::new(),
            variables,
        });
        let root = self.graph.root();
        self.graph.add_edge(root, host_node);

        let mut walk = HostWalk {
            host: host.id,
            host_name: &host.name,
            host_node,
            base_path,
            open: HashSet::new(),
        };
        for &child in host.content.contains() {
            let mut path = walk.base_path.clone();
            if let Some(idx) = self.visit(&mut walk, child, &mut path) {
                self.graph.add_edge(host_node, idx);
            }
        }
    }

    fn visit(
        &mut self,
        walk: &mut HostWalk<'a>,
        id: ObjectId,
        path: &mut Vec<ObjectId>,
    ) -> Option<NodeIndex> {
        let objects = self.objects;
        let parent = path
            .last()
            .and_then(|p| objects.get(p))
            .map(|o| o.name.as_str())
            .unwrap_or(walk.host_name);

        let Some(obj) = objects.get(&id) else {
            self.errors.push(ValidationError::MissingObject {
                id,
                host: walk.host_name.to_string(),
                parent: parent.to_string(),
            });
            return None;
        };

        if !self.validate(walk, obj, parent, path) {
            return None;
        }

        let key = self.scope_key(walk.host, obj, path);
        if let Some(existing) = self.graph.lookup(&key) {
            return Some(existing);
        }

        walk.open.insert(id);
        path.push(id);

        let variables = self.scope_variables(path);
        let idx = self.graph.insert(PlanNode {
            key,
            object: Some(id),
            class: obj.class(),
            host: Some(walk.host),
            next: Vec::new(),
            variables,
        });
        tracing::trace!("node {} for {} ({})", self.graph.node(idx).key, obj.name, obj.class());

        for &child in obj.content.contains() {
            if let Some(child_idx) = self.visit(walk, child, path) {
                self.graph.add_edge(idx, child_idx);
            }
        }

        for &dep in obj.content.depends() {
            let mut dep_path = walk.base_path.clone();
            if let Some(dep_idx) = self.visit(walk, dep, &mut dep_path) {
                self.graph.add_edge(walk.host_node, dep_idx);
                self.graph.add_edge(dep_idx, idx);
            }
        }

        path.pop();
        walk.open.remove(&id);
        Some(idx)
    }

    /// Record every rule `obj` breaks at this position; `true` when none.
    fn validate(
        &mut self,
        walk: &HostWalk<'a>,
        obj: &ConfigObject,
        parent: &str,
        path: &[ObjectId],
    ) -> bool {
        let mut ok = true;

        // A containment cycle also leaves the object open; report it once.
        if path.contains(&obj.id) {
            self.errors.push(ValidationError::ContainmentCycle {
                parent: parent.to_string(),
                object: obj.name.clone(),
            });
            ok = false;
        } else if walk.open.contains(&obj.id) {
            self.errors.push(ValidationError::DependencyCycle {
                parent: parent.to_string(),
                object: obj.name.clone(),
            });
            ok = false;
        }

        let objects = self.objects;
        let enclosing_user = path
            .iter()
            .filter_map(|p| objects.get(p))
            .find(|o| o.class() == ObjectClass::User);
        match enclosing_user {
            Some(user) => {
                if !matches!(obj.class(), ObjectClass::File | ObjectClass::Collection) {
                    self.errors.push(ValidationError::ScopeViolation {
                        object: obj.name.clone(),
                        class: obj.class(),
                        user: user.name.clone(),
                    });
                    ok = false;
                }
            }
            None if obj.class() == ObjectClass::Host => {
                self.errors.push(ValidationError::NestedHost {
                    object: obj.name.clone(),
                    host: walk.host_name.to_string(),
                });
                ok = false;
            }
            None => {}
        }

        ok
    }

    /// Users, groups and packages get one node per host. Everything else is
    /// keyed by the scope-defining ancestors on its path.
    fn scope_key(&self, host: ObjectId, obj: &ConfigObject, path: &[ObjectId]) -> NodeKey {
        match obj.class() {
            ObjectClass::User | ObjectClass::Group | ObjectClass::Package => {
                NodeKey::from_path(&[host, obj.id])
            }
            ObjectClass::Root
            | ObjectClass::Host
            | ObjectClass::File
            | ObjectClass::Collection
            | ObjectClass::FirewallRule => {
                let mut scoped: Vec<ObjectId> = path
                    .iter()
                    .copied()
                    .filter(|p| self.objects.get(p).is_some_and(defines_scope))
                    .collect();
                scoped.push(obj.id);
                NodeKey::from_path(&scoped)
            }
        }
    }

    /// Variables visible at the end of `path`, outermost first.
    fn scope_variables(&self, path: &[ObjectId]) -> TemplateContext {
        let mut ctx = TemplateContext::new();
        for obj in path.iter().filter_map(|p| self.objects.get(p)) {
            ctx.extend_from(obj.content.variables());
            match obj.class() {
                ObjectClass::Host => ctx.set_hostname(obj.name.as_str()),
                ObjectClass::User => ctx.set_user(obj.name.as_str()),
                _ => {}
            }
        }
        ctx
    }
}

fn defines_scope(obj: &ConfigObject) -> bool {
    match obj.class() {
        ObjectClass::User | ObjectClass::Host => true,
        ObjectClass::Collection => !obj.content.variables().is_empty(),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
