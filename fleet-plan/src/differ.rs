//! Differ: scheduled nodes plus last-deployed state in, deployment units out.

use std::collections::BTreeMap;

use similar::TextDiff;

use fleet_core::{DeployedUnit, ObjectClass, ObjectContent, ObjectId};
use fleet_renderer::{apply_templates, Interpolator, TemplateContext};

use crate::builder::ObjectIndex;
use crate::error::PlanError;
use crate::graph::{NodeIndex, PlanGraph};
use crate::unit::{DeploymentUnit, UnitAction, UnitStatus};

type DeployedByHost = BTreeMap<ObjectId, BTreeMap<String, DeployedUnit>>;

fn group_by_host(last_deployed: Vec<DeployedUnit>) -> DeployedByHost {
    let mut grouped = DeployedByHost::new();
    for unit in last_deployed {
        grouped
            .entry(unit.host)
            .or_default()
            .insert(unit.name.clone(), unit);
    }
    grouped
}

fn host_name(objects: &ObjectIndex, host: ObjectId) -> String {
    objects
        .get(&host)
        .map(|o| o.name.clone())
        .unwrap_or_else(|| host.to_string())
}

/// Turn scheduled nodes into deployment units.
///
/// Each deployable node becomes an Add, or a Modify when the host already
/// has an entry under the same key. Every host whose own node was scheduled
/// then gets a Remove for each entry nothing claimed, in reverse creation
/// order (class order descending, then key).
pub fn materialize(
    graph: &PlanGraph,
    order: &[NodeIndex],
    objects: &ObjectIndex,
    last_deployed: Vec<DeployedUnit>,
) -> Vec<DeploymentUnit> {
    let mut deployed = group_by_host(last_deployed);
    let mut full_hosts: Vec<ObjectId> = Vec::new();
    let mut units: Vec<DeploymentUnit> = Vec::new();

    for &idx in order {
        let node = graph.node(idx);
        if node.class == ObjectClass::Host {
            full_hosts.extend(node.object);
        }
        if node.class.is_structural() {
            continue;
        }
        let (Some(object_id), Some(host)) = (node.object, node.host) else {
            continue;
        };
        let Some(obj) = objects.get(&object_id) else {
            continue;
        };

        let key = node.key.to_string();
        let prev = deployed
            .get_mut(&host)
            .and_then(|entries| entries.remove(&key))
            .map(|d| d.content);
        let action = if prev.is_some() {
            UnitAction::Modify
        } else {
            UnitAction::Add
        };
        warn_unresolved(&obj.content, &obj.name, &node.variables);
        let next = apply_templates(obj.content.clone(), &obj.name, &node.variables);

        units.push(DeploymentUnit {
            index: units.len(),
            class: obj.class(),
            host,
            host_name: host_name(objects, host),
            name: obj.name.clone(),
            key,
            object: Some(object_id),
            enabled: true,
            status: UnitStatus::Normal,
            action,
            prev,
            next: Some(next),
            variables: node.variables.clone(),
        });
    }

    for host in full_hosts {
        let Some(entries) = deployed.remove(&host) else {
            continue;
        };
        let mut orphans: Vec<DeployedUnit> = entries.into_values().collect();
        orphans.sort_by(|l, r| {
            r.class
                .class_order()
                .cmp(&l.class.class_order())
                .then_with(|| l.name.cmp(&r.name))
        });
        for orphan in orphans {
            units.push(DeploymentUnit {
                index: units.len(),
                class: orphan.class,
                host,
                host_name: host_name(objects, host),
                name: orphan.title,
                key: orphan.name,
                object: None,
                enabled: true,
                status: UnitStatus::Normal,
                action: UnitAction::Remove,
                prev: Some(orphan.content),
                next: None,
                variables: TemplateContext::new(),
            });
        }
    }

    let removals = units
        .iter()
        .filter(|u| u.action == UnitAction::Remove)
        .count();
    tracing::debug!(
        "materialized {} unit(s), {} removal(s)",
        units.len(),
        removals
    );
    units
}

// ---------------------------------------------------------------------------
// Review diffs
// ---------------------------------------------------------------------------

fn pretty(content: Option<&ObjectContent>) -> Result<String, PlanError> {
    match content {
        Some(content) => Ok(format!("{}\n", serde_json::to_string_pretty(content)?)),
        None => Ok(String::new()),
    }
}

/// Unified diff of a unit's previous and desired content as pretty JSON.
///
/// Empty when both sides are identical.
pub fn unit_diff(unit: &DeploymentUnit) -> Result<String, PlanError> {
    let old = pretty(unit.prev.as_ref())?;
    let new = pretty(unit.next.as_ref())?;
    if old == new {
        return Ok(String::new());
    }
    let old_header = format!("a/{}/{}", unit.host_name, unit.name);
    let new_header = format!("b/{}/{}", unit.host_name, unit.name);
    Ok(TextDiff::from_lines(&old, &new)
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string())
}

/// Placeholders with no value survive templating verbatim; say so.
fn warn_unresolved(content: &ObjectContent, name: &str, ctx: &TemplateContext) {
    let ObjectContent::File(file) = content else {
        return;
    };
    let mut missing = Interpolator::unresolved(&file.path, ctx);
    missing.extend(Interpolator::unresolved(&file.data, ctx));
    missing.sort();
    missing.dedup();
    if !missing.is_empty() {
        tracing::warn!("{name}: unresolved placeholders {}", missing.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::types::PackageContent;

    use super::*;

    fn pkg_unit(prev: Option<&str>, next: Option<&str>) -> DeploymentUnit {
        let content = |name: &str| {
            ObjectContent::Package(PackageContent {
                name: Some(name.to_string()),
                depends: vec![],
            })
        };
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
            prev: prev.map(content),
            next: next.map(content),
            variables: TemplateContext::new(),
        }
    }

    #[test]
    fn diff_has_host_scoped_headers() {
        let diff = unit_diff(&pkg_unit(Some("nginx"), Some("nginx-full"))).expect("diff");
        assert!(diff.contains("--- a/web1/nginx"), "got: {diff}");
        assert!(diff.contains("+++ b/web1/nginx"));
        assert!(diff.contains("-  \"name\": \"nginx\""));
        assert!(diff.contains("+  \"name\": \"nginx-full\""));
    }

    #[test]
    fn identical_content_has_empty_diff() {
        let diff = unit_diff(&pkg_unit(Some("nginx"), Some("nginx"))).expect("diff");
        assert!(diff.is_empty());
    }

    #[test]
    fn removal_diff_deletes_every_line() {
        let diff = unit_diff(&pkg_unit(Some("nginx"), None)).expect("diff");
        assert!(diff.lines().filter(|l| l.starts_with('+') && !l.starts_with("+++")).count() == 0);
        assert!(diff.contains("-  \"class\": \"package\""));
    }
}
