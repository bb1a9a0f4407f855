//! Shared planning entrypoint used by the CLI preview and the daemon.

use fleet_core::{ObjectId, ObjectStore};

use crate::builder::{build, index_objects};
use crate::differ::materialize;
use crate::error::{PlanError, ValidationErrors};
use crate::scheduler::order;
use crate::unit::DeploymentUnit;

/// Build, order and diff the newest objects in `store`.
///
/// `target` restricts the plan to what is reachable from that object;
/// `None` plans every host. Validation problems come back as
/// [`PlanError::InvalidTree`] carrying every error found.
pub fn plan(
    store: &dyn ObjectStore,
    target: Option<ObjectId>,
) -> Result<Vec<DeploymentUnit>, PlanError> {
    let objects = index_objects(store.list_newest_objects()?);
    let built = build(&objects);
    if !built.is_valid() {
        tracing::warn!("plan rejected: {} validation error(s)", built.errors.len());
        return Err(PlanError::InvalidTree(ValidationErrors(built.errors)));
    }

    let ordered = order(&built.graph, target)?;
    let last_deployed = store.last_deployed(None)?;
    let units = materialize(&built.graph, &ordered, &objects, last_deployed);

    match target {
        Some(id) => tracing::info!("planned {} unit(s) for target {}", units.len(), id),
        None => tracing::info!("planned {} unit(s) for full deployment", units.len()),
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use fleet_core::MemoryStore;

    use super::*;

    #[test]
    fn empty_store_plans_nothing() {
        let store = MemoryStore::new();
        let units = plan(&store, None).expect("plan");
        assert!(units.is_empty());
    }
}
