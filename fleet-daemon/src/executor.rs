//! Execution engine: walks a started run's units strictly in order.
//!
//! Awaiting a job's terminal message is the only suspension point. A host
//! whose unit failed (or whose link is down) is marked bad for the rest of
//! the run; its remaining units fail without a remote call.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use fleet_core::{DeployedUnit, ObjectContent, ObjectId, ObjectStore};
use fleet_plan::{DeploymentUnit, UnitAction, UnitStatus};

use crate::connection::JobDispatcher;
use crate::coordinator::Run;
use crate::job::{DeployJob, JobOutcome};
use crate::protocol::{OutputType, ScriptRequest, StdinType};
use crate::publisher::Deployment;
use crate::scripts::{deploy_script_name, ScriptCatalog};

pub struct Executor {
    deployment: Arc<Deployment>,
    dispatcher: Arc<dyn JobDispatcher>,
    store: Arc<dyn ObjectStore>,
    scripts: ScriptCatalog,
    interpreter: String,
}

impl Executor {
    pub fn new(
        deployment: Arc<Deployment>,
        dispatcher: Arc<dyn JobDispatcher>,
        store: Arc<dyn ObjectStore>,
        scripts: ScriptCatalog,
        interpreter: impl Into<String>,
    ) -> Self {
        Self {
            deployment,
            dispatcher,
            store,
            scripts,
            interpreter: interpreter.into(),
        }
    }

    /// Deploy `run` to completion or until it stops being current.
    pub async fn execute(&self, run: Run) {
        let generation = run.generation;
        let mut bad_hosts: HashSet<ObjectId> = HashSet::new();

        for unit in &run.units {
            if !self.deployment.read(|c| c.is_current(generation)).await {
                tracing::info!(generation, "deployment stopped before unit {}", unit.index);
                return;
            }
            if !unit.enabled {
                continue;
            }
            if bad_hosts.contains(&unit.host) {
                self.set_status(generation, unit.index, UnitStatus::Failure).await;
                continue;
            }
            if !self.dispatcher.is_up(unit.host) {
                tracing::warn!(host = %unit.host_name, index = unit.index, "host is down");
                self.log(generation, format!("Host {} is down", unit.host_name))
                    .await;
                bad_hosts.insert(unit.host);
                self.set_status(generation, unit.index, UnitStatus::Failure).await;
                continue;
            }

            let status = self.deploy_unit(generation, unit).await;
            if status == UnitStatus::Failure {
                tracing::warn!(host = %unit.host_name, index = unit.index, "host marked bad");
                bad_hosts.insert(unit.host);
            }
            self.set_status(generation, unit.index, status).await;
        }

        self.deployment.emit(|c| c.finish_run(generation)).await;
    }

    async fn deploy_unit(&self, generation: u64, unit: &DeploymentUnit) -> UnitStatus {
        let script = match self.scripts.deploy_script(unit.class).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                self.log(generation, format!("No deploy script for class {}", unit.class))
                    .await;
                return UnitStatus::Failure;
            }
            Err(err) => {
                tracing::error!(error = %err, "loading deploy script failed");
                self.log(generation, format!("Failed: {err}")).await;
                return UnitStatus::Failure;
            }
        };
        let input = match job_input(unit) {
            Ok(input) => input,
            Err(err) => {
                self.log(generation, format!("Failed: {err}")).await;
                return UnitStatus::Failure;
            }
        };

        self.set_status(generation, unit.index, UnitStatus::Deploying).await;

        let (log_tx, mut log_rx) = mpsc::unbounded_channel();
        let (job, mut done) = DeployJob::new(log_tx);
        let request = ScriptRequest {
            name: deploy_script_name(unit.class),
            interpreter: self.interpreter.clone(),
            content: script,
            args: Vec::new(),
            stdin_type: StdinType::GivenJson,
            input_json: Some(input),
            stdout_type: OutputType::Binary,
            stderr_type: OutputType::Binary,
        };
        let job_id = match self.dispatcher.run_script(unit.host, request, Box::new(job)) {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(host = %unit.host_name, error = %err, "dispatch failed");
                self.log(generation, format!("Host {} is down", unit.host_name))
                    .await;
                return UnitStatus::Failure;
            }
        };
        tracing::info!(host = %unit.host_name, index = unit.index, job = %job_id, "unit dispatched");
        self.log(generation, format!("=====> {} ({}) <=====", unit.name, unit.class))
            .await;

        let outcome = loop {
            tokio::select! {
                biased;
                Some(chunk) = log_rx.recv() => self.log(generation, chunk).await,
                outcome = &mut done => break outcome.unwrap_or(JobOutcome::Failure),
            }
        };
        while let Ok(chunk) = log_rx.try_recv() {
            self.log(generation, chunk).await;
        }

        tracing::info!(host = %unit.host_name, index = unit.index, ?outcome, "unit finished");
        match outcome.failure_line() {
            Some(line) => {
                self.log(generation, line).await;
                UnitStatus::Failure
            }
            None => {
                self.record(generation, unit).await;
                UnitStatus::Success
            }
        }
    }

    /// Update the last-deployed snapshot after a successful unit.
    async fn record(&self, generation: u64, unit: &DeploymentUnit) {
        let entry = match (unit.action, &unit.next) {
            (UnitAction::Remove, _) => None,
            (_, Some(content)) => Some(DeployedUnit {
                host: unit.host,
                name: unit.key.clone(),
                class: unit.class,
                title: unit.name.clone(),
                content: content.clone(),
                deployed_at: Utc::now(),
            }),
            (_, None) => return,
        };

        let store = self.store.clone();
        let host = unit.host;
        let key = unit.key.clone();
        let result = tokio::task::spawn_blocking(move || store.record_deployed(host, &key, entry))
            .await
            .map_err(|err| err.to_string())
            .and_then(|inner| inner.map_err(|err| err.to_string()));

        if let Err(err) = result {
            tracing::error!(host = %unit.host_name, index = unit.index, error = %err, "recording deployed state failed");
            self.log(generation, format!("Failed to record deployed state: {err}"))
                .await;
        }
    }

    async fn log(&self, generation: u64, line: String) {
        self.deployment
            .emit(|c| c.append_log(generation, line))
            .await;
    }

    async fn set_status(&self, generation: u64, index: usize, status: UnitStatus) {
        self.deployment
            .emit(|c| c.set_unit_status(generation, index, status))
            .await;
    }
}

/// Standard input of a deploy script: `{old, new}`, `{}` for an absent side.
pub fn job_input(unit: &DeploymentUnit) -> Result<Value, serde_json::Error> {
    fn side(content: &Option<ObjectContent>) -> Result<Value, serde_json::Error> {
        match content {
            Some(content) => serde_json::to_value(content),
            None => Ok(json!({})),
        }
    }
    Ok(json!({ "old": side(&unit.prev)?, "new": side(&unit.next)? }))
}
