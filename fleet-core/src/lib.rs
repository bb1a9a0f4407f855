//! Fleet core library: object model, store contract, errors.
//!
//! Public API surface:
//! - [`types`]: newtypes, the class-tagged content union, deployed snapshots
//! - [`error`]: [`StoreError`]
//! - [`store`]: [`ObjectStore`] plus file-backed and in-memory stores

pub mod error;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use store::{FileStore, MemoryStore, ObjectStore};
pub use types::{
    ConfigObject, DeployedUnit, ObjectClass, ObjectContent, ObjectDraft, ObjectId, SavedVersion,
    Variable,
};
