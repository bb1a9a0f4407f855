//! Error types for fleet-plan.

use std::fmt;

use thiserror::Error;

use fleet_core::{ObjectClass, ObjectId, StoreError};

/// One rule violation found while building the plan graph.
///
/// Validation never stops the builder; every violation is collected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A `contains` or `depends` entry names an id the store does not have.
    #[error("Missing object {id} for host {host} in {parent}")]
    MissingObject {
        id: ObjectId,
        host: String,
        parent: String,
    },

    /// An object is reachable from itself through containment.
    #[error("{parent} contains {object}, of which it is itself a member")]
    ContainmentCycle { parent: String, object: String },

    /// An object is reachable from itself through a chain of open dependencies.
    #[error("{parent} depends on {object}, which through a chain of dependencies requires {parent}")]
    DependencyCycle { parent: String, object: String },

    /// Only files and collections may live inside a user.
    #[error("{object} of class {class} is contained in user {user}, but only files and collections are allowed")]
    ScopeViolation {
        object: String,
        class: ObjectClass,
        user: String,
    },

    /// A host may not be nested inside another host's scope.
    #[error("{object} of class host is contained in the host {host}")]
    NestedHost { object: String, host: String },
}

/// Newline-joined list of validation errors, as published to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// All errors that can arise from planning.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The object tree violates one or more validation rules.
    #[error("{0}")]
    InvalidTree(ValidationErrors),

    /// The scheduler could not order every reachable node. The builder
    /// guarantees acyclicity, so this is a bug rather than bad input.
    #[error("internal consistency error: {} node(s) never became ready: {}", .stuck.len(), .stuck.join(", "))]
    Internal { stuck: Vec<String> },

    /// The object store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Content could not be rendered as JSON for review.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlanError {
    /// The validation errors when this is [`PlanError::InvalidTree`].
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            PlanError::InvalidTree(errors) => &errors.0,
            PlanError::Internal { .. } | PlanError::Store(_) | PlanError::Json(_) => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_tree_joins_messages_with_newlines() {
        let err = PlanError::InvalidTree(ValidationErrors(vec![
            ValidationError::MissingObject {
                id: ObjectId(42),
                host: "web1".into(),
                parent: "alice".into(),
            },
            ValidationError::NestedHost {
                object: "db1".into(),
                host: "web1".into(),
            },
        ]));
        assert_eq!(
            err.to_string(),
            "Missing object 42 for host web1 in alice\ndb1 of class host is contained in the host web1"
        );
        assert_eq!(err.validation_errors().len(), 2);
    }

    #[test]
    fn internal_error_lists_stuck_keys() {
        let err = PlanError::Internal {
            stuck: vec!["10.11".into(), "10.12".into()],
        };
        assert!(err.to_string().contains("2 node(s)"));
        assert!(err.to_string().contains("10.11, 10.12"));
    }
}
