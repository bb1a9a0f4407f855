//! # fleet-plan
//!
//! Deployment planning: graph construction, validation, ordering and diffing.
//!
//! Call [`plan`] to turn the newest objects in an [`fleet_core::ObjectStore`]
//! into an ordered list of [`DeploymentUnit`]s ready for review.

pub mod builder;
pub mod differ;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod scheduler;
pub mod unit;

pub use builder::{build, index_objects, BuildOutput, ObjectIndex};
pub use differ::{materialize, unit_diff};
pub use error::{PlanError, ValidationError, ValidationErrors};
pub use graph::{NodeIndex, NodeKey, PlanGraph, PlanNode};
pub use pipeline::plan;
pub use scheduler::order;
pub use unit::{content_digest, DeploymentUnit, UnitAction, UnitStatus, UnitView};
