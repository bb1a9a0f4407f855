//! Deployment state machine.
//!
//! ```text
//! Idle -> BuildingTree -> InvalidTree | ReviewChanges -> Deploying -> Idle
//!                                       ReviewChanges -> Idle   (cancel)
//! ```
//!
//! Every method returns the [`DeploymentEvent`]s its mutation produced; the
//! caller hands them to a [`crate::publisher::Publisher`]. Nothing in here
//! touches a transport.

use std::fmt;

use serde::{Deserialize, Serialize};

use fleet_plan::{DeploymentUnit, PlanError, UnitStatus, UnitView};

use crate::error::DaemonError;

pub const LOG_STARTED: &str = "Deployment started";
pub const LOG_FINISHED: &str = "Deployment finished";
pub const LOG_STOPPED: &str = "Deployment stopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    #[default]
    Idle,
    BuildingTree,
    InvalidTree,
    ReviewChanges,
    Deploying,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeploymentStatus::Idle => "idle",
            DeploymentStatus::BuildingTree => "building-tree",
            DeploymentStatus::InvalidTree => "invalid-tree",
            DeploymentStatus::ReviewChanges => "review-changes",
            DeploymentStatus::Deploying => "deploying",
        };
        f.write_str(label)
    }
}

/// Observable change, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeploymentEvent {
    StatusChanged { status: DeploymentStatus },
    MessageChanged { message: String },
    UnitsReplaced { units: Vec<UnitView> },
    UnitChanged { unit: UnitView },
    LogAppended { line: String },
    LogCleared,
    /// Sent only to a subscriber that fell behind and lost `skipped` events;
    /// `snapshot` replaces everything it has rendered so far.
    Resync {
        skipped: u64,
        snapshot: Box<Snapshot>,
    },
}

/// A started run: its generation and the units as they were at `start`.
#[derive(Debug, Clone)]
pub struct Run {
    pub generation: u64,
    pub units: Vec<DeploymentUnit>,
}

/// Point-in-time copy of everything a subscriber needs to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub status: DeploymentStatus,
    pub message: String,
    pub units: Vec<UnitView>,
    pub log: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Coordinator {
    status: DeploymentStatus,
    message: String,
    units: Vec<DeploymentUnit>,
    log: Vec<String>,
    generation: u64,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> DeploymentStatus {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn units(&self) -> &[DeploymentUnit] {
        &self.units
    }

    pub fn unit(&self, index: usize) -> Option<&DeploymentUnit> {
        self.units.get(index)
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn views(&self) -> Vec<UnitView> {
        self.units.iter().map(DeploymentUnit::view).collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            status: self.status,
            message: self.message.clone(),
            units: self.views(),
            log: self.log.clone(),
        }
    }

    fn require(&self, op: &'static str, allowed: &[DeploymentStatus]) -> Result<(), DaemonError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DaemonError::InvalidState {
                op,
                status: self.status,
            })
        }
    }

    fn set_status(&mut self, status: DeploymentStatus, events: &mut Vec<DeploymentEvent>) {
        self.status = status;
        events.push(DeploymentEvent::StatusChanged { status });
    }

    fn set_message(&mut self, message: String, events: &mut Vec<DeploymentEvent>) {
        self.message = message.clone();
        events.push(DeploymentEvent::MessageChanged { message });
    }

    fn push_log(&mut self, line: String, events: &mut Vec<DeploymentEvent>) {
        self.log.push(line.clone());
        events.push(DeploymentEvent::LogAppended { line });
    }

    // -----------------------------------------------------------------------
    // Operator transitions
    // -----------------------------------------------------------------------

    /// Enter BuildingTree. The caller runs the planner and reports back with
    /// [`Coordinator::complete_plan`].
    pub fn begin_plan(&mut self) -> Result<Vec<DeploymentEvent>, DaemonError> {
        use DeploymentStatus::*;
        self.require("plan", &[Idle, InvalidTree, ReviewChanges])?;

        let mut events = Vec::new();
        self.log.clear();
        events.push(DeploymentEvent::LogCleared);
        self.set_message(String::new(), &mut events);
        self.units.clear();
        events.push(DeploymentEvent::UnitsReplaced { units: Vec::new() });
        self.set_status(BuildingTree, &mut events);
        Ok(events)
    }

    /// Apply the planner's result.
    ///
    /// Validation errors park the machine in InvalidTree. Store and
    /// internal failures are published, return it to Idle, and are handed
    /// back so the caller can report them.
    pub fn complete_plan(
        &mut self,
        result: Result<Vec<DeploymentUnit>, PlanError>,
    ) -> (Vec<DeploymentEvent>, Option<PlanError>) {
        let mut events = Vec::new();
        if self.status != DeploymentStatus::BuildingTree {
            tracing::warn!(status = %self.status, "discarding plan result");
            return (events, None);
        }

        match result {
            Ok(units) => {
                self.units = units;
                events.push(DeploymentEvent::UnitsReplaced {
                    units: self.views(),
                });
                self.set_status(DeploymentStatus::ReviewChanges, &mut events);
                (events, None)
            }
            Err(PlanError::InvalidTree(errors)) => {
                self.set_message(errors.to_string(), &mut events);
                self.set_status(DeploymentStatus::InvalidTree, &mut events);
                (events, None)
            }
            Err(err) => {
                self.set_message(err.to_string(), &mut events);
                self.set_status(DeploymentStatus::Idle, &mut events);
                (events, Some(err))
            }
        }
    }

    /// The planner never reported back; leave BuildingTree with `message`.
    pub fn abort_plan(&mut self, message: String) -> Vec<DeploymentEvent> {
        let mut events = Vec::new();
        if self.status == DeploymentStatus::BuildingTree {
            self.set_message(message, &mut events);
            self.set_status(DeploymentStatus::Idle, &mut events);
        }
        events
    }

    pub fn toggle(&mut self, index: usize, enabled: bool) -> Result<Vec<DeploymentEvent>, DaemonError> {
        self.require("toggle", &[DeploymentStatus::ReviewChanges])?;
        let unit = self
            .units
            .get_mut(index)
            .ok_or(DaemonError::UnitNotFound { index })?;
        unit.enabled = enabled;
        Ok(vec![DeploymentEvent::UnitChanged { unit: unit.view() }])
    }

    /// Enter Deploying and open a new run generation.
    pub fn start(&mut self) -> Result<(Run, Vec<DeploymentEvent>), DaemonError> {
        self.require("start", &[DeploymentStatus::ReviewChanges])?;

        let mut events = Vec::new();
        self.generation += 1;
        self.set_status(DeploymentStatus::Deploying, &mut events);
        self.push_log(LOG_STARTED.to_string(), &mut events);
        let run = Run {
            generation: self.generation,
            units: self.units.clone(),
        };
        Ok((run, events))
    }

    /// Back to Idle. The executor notices before its next unit; an
    /// in-flight job runs to completion and its result is ignored.
    pub fn stop(&mut self) -> Result<Vec<DeploymentEvent>, DaemonError> {
        self.require("stop", &[DeploymentStatus::Deploying])?;

        let mut events = Vec::new();
        self.set_status(DeploymentStatus::Idle, &mut events);
        self.push_log(LOG_STOPPED.to_string(), &mut events);
        Ok(events)
    }

    pub fn cancel(&mut self) -> Result<Vec<DeploymentEvent>, DaemonError> {
        self.require("cancel", &[DeploymentStatus::ReviewChanges])?;

        let mut events = Vec::new();
        self.units.clear();
        events.push(DeploymentEvent::UnitsReplaced { units: Vec::new() });
        self.set_status(DeploymentStatus::Idle, &mut events);
        Ok(events)
    }

    // -----------------------------------------------------------------------
    // Run updates; no-ops once `generation` is stale
    // -----------------------------------------------------------------------

    /// `true` while run `generation` is the one being deployed.
    pub fn is_current(&self, generation: u64) -> bool {
        self.status == DeploymentStatus::Deploying && self.generation == generation
    }

    pub fn append_log(&mut self, generation: u64, line: impl Into<String>) -> Vec<DeploymentEvent> {
        let mut events = Vec::new();
        if self.is_current(generation) {
            self.push_log(line.into(), &mut events);
        }
        events
    }

    pub fn set_unit_status(
        &mut self,
        generation: u64,
        index: usize,
        status: UnitStatus,
    ) -> Vec<DeploymentEvent> {
        if !self.is_current(generation) {
            return Vec::new();
        }
        match self.units.get_mut(index) {
            Some(unit) => {
                unit.status = status;
                vec![DeploymentEvent::UnitChanged { unit: unit.view() }]
            }
            None => Vec::new(),
        }
    }

    pub fn finish_run(&mut self, generation: u64) -> Vec<DeploymentEvent> {
        let mut events = Vec::new();
        if self.is_current(generation) {
            self.push_log(LOG_FINISHED.to_string(), &mut events);
            self.set_status(DeploymentStatus::Idle, &mut events);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::{ObjectClass, ObjectId};
    use fleet_plan::{UnitAction, ValidationError, ValidationErrors};

    use super::*;

    fn unit(index: usize) -> DeploymentUnit {
        DeploymentUnit {
            index,
            class: ObjectClass::Package,
            host: ObjectId(10_001),
            host_name: "web1".into(),
            name: format!("pkg{index}"),
            key: format!("10001.pkg{index}"),
            object: Some(ObjectId(10_100 + index as i64)),
            enabled: true,
            status: UnitStatus::Normal,
            action: UnitAction::Add,
            prev: None,
            next: None,
            variables: Default::default(),
        }
    }

    fn reviewing(n: usize) -> Coordinator {
        let mut c = Coordinator::new();
        c.begin_plan().expect("plan");
        let (_, err) = c.complete_plan(Ok((0..n).map(unit).collect()));
        assert!(err.is_none());
        c
    }

    #[test]
    fn plan_publishes_units_and_enters_review() {
        let mut c = Coordinator::new();
        let events = c.begin_plan().expect("plan");
        assert_eq!(c.status(), DeploymentStatus::BuildingTree);
        assert!(events.contains(&DeploymentEvent::LogCleared));

        let (events, err) = c.complete_plan(Ok(vec![unit(0), unit(1)]));
        assert!(err.is_none());
        assert_eq!(c.status(), DeploymentStatus::ReviewChanges);
        assert!(matches!(&events[0], DeploymentEvent::UnitsReplaced { units } if units.len() == 2));
    }

    #[test]
    fn validation_failure_parks_in_invalid_tree_with_joined_message() {
        let mut c = Coordinator::new();
        c.begin_plan().expect("plan");
        let errors = ValidationErrors(vec![
            ValidationError::NestedHost {
                object: "db".into(),
                host: "web1".into(),
            },
            ValidationError::ContainmentCycle {
                parent: "a".into(),
                object: "b".into(),
            },
        ]);
        let (_, err) = c.complete_plan(Err(PlanError::InvalidTree(errors)));
        assert!(err.is_none());
        assert_eq!(c.status(), DeploymentStatus::InvalidTree);
        assert_eq!(c.message().lines().count(), 2);

        // terminal until the next plan
        assert!(c.start().is_err());
        assert!(c.begin_plan().is_ok());
    }

    #[test]
    fn internal_failure_returns_to_idle_and_surfaces_error() {
        let mut c = Coordinator::new();
        c.begin_plan().expect("plan");
        let (events, err) = c.complete_plan(Err(PlanError::Internal {
            stuck: vec!["10001.x".into()],
        }));
        assert!(matches!(err, Some(PlanError::Internal { .. })));
        assert_eq!(c.status(), DeploymentStatus::Idle);
        assert!(events
            .iter()
            .any(|e| matches!(e, DeploymentEvent::MessageChanged { message } if message.contains("10001.x"))));
    }

    #[test]
    fn transitions_outside_their_state_are_rejected() {
        let mut c = Coordinator::new();
        assert!(matches!(
            c.toggle(0, false),
            Err(DaemonError::InvalidState { op: "toggle", status: DeploymentStatus::Idle })
        ));
        assert!(c.start().is_err());
        assert!(c.stop().is_err());
        assert!(c.cancel().is_err());

        c.begin_plan().expect("plan");
        assert!(c.begin_plan().is_err(), "no concurrent planning");

        let mut c = reviewing(1);
        c.start().expect("start");
        assert!(c.begin_plan().is_err(), "no planning while deploying");
        assert!(c.toggle(0, true).is_err());
    }

    #[test]
    fn toggle_updates_one_unit() {
        let mut c = reviewing(3);
        let events = c.toggle(1, false).expect("toggle");
        assert_eq!(events.len(), 1);
        assert!(!c.units()[1].enabled);
        assert!(c.units()[0].enabled && c.units()[2].enabled);
        assert!(matches!(c.toggle(7, false), Err(DaemonError::UnitNotFound { index: 7 })));
    }

    #[test]
    fn cancel_discards_units() {
        let mut c = reviewing(2);
        c.cancel().expect("cancel");
        assert_eq!(c.status(), DeploymentStatus::Idle);
        assert!(c.units().is_empty());
    }

    #[test]
    fn stale_generation_updates_are_ignored() {
        let mut c = reviewing(2);
        let (run, _) = c.start().expect("start");
        assert_eq!(c.log(), [LOG_STARTED]);

        c.stop().expect("stop");
        assert!(c.set_unit_status(run.generation, 0, UnitStatus::Success).is_empty());
        assert!(c.append_log(run.generation, "late output").is_empty());
        assert!(c.finish_run(run.generation).is_empty());
        assert_eq!(c.units()[0].status, UnitStatus::Normal);
        assert_eq!(c.log(), [LOG_STARTED, LOG_STOPPED]);
    }

    #[test]
    fn finish_returns_to_idle() {
        let mut c = reviewing(1);
        let (run, _) = c.start().expect("start");
        c.set_unit_status(run.generation, 0, UnitStatus::Success);
        let events = c.finish_run(run.generation);
        assert_eq!(c.status(), DeploymentStatus::Idle);
        assert_eq!(
            events.last(),
            Some(&DeploymentEvent::StatusChanged {
                status: DeploymentStatus::Idle
            })
        );
        assert_eq!(c.units()[0].status, UnitStatus::Success);
    }
}
