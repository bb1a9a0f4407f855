//! Event fan-out and the shared, lock-guarded coordinator.

use tokio::sync::{broadcast, Mutex};

use crate::coordinator::{Coordinator, DeploymentEvent, Snapshot};
use crate::error::DaemonError;

/// Forwards coordinator events to every subscriber.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: broadcast::Sender<DeploymentEvent>,
}

impl Publisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send in order. Having no subscribers is not an error.
    pub fn publish(&self, events: Vec<DeploymentEvent>) {
        for event in events {
            let _ = self.tx.send(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// The coordinator plus its publisher.
///
/// Events are published while the lock is held, so subscribers see them in
/// mutation order.
#[derive(Debug)]
pub struct Deployment {
    coordinator: Mutex<Coordinator>,
    publisher: Publisher,
}

impl Deployment {
    pub fn new(event_buffer: usize) -> Self {
        Self {
            coordinator: Mutex::new(Coordinator::new()),
            publisher: Publisher::new(event_buffer),
        }
    }

    /// Run an infallible mutation and publish its events.
    pub async fn emit(&self, f: impl FnOnce(&mut Coordinator) -> Vec<DeploymentEvent>) {
        let mut coordinator = self.coordinator.lock().await;
        let events = f(&mut coordinator);
        self.publisher.publish(events);
    }

    /// Run a fallible mutation; events are published only on success.
    pub async fn apply<T>(
        &self,
        f: impl FnOnce(&mut Coordinator) -> Result<(T, Vec<DeploymentEvent>), DaemonError>,
    ) -> Result<T, DaemonError> {
        let mut coordinator = self.coordinator.lock().await;
        let (value, events) = f(&mut coordinator)?;
        self.publisher.publish(events);
        Ok(value)
    }

    pub async fn read<T>(&self, f: impl FnOnce(&Coordinator) -> T) -> T {
        let coordinator = self.coordinator.lock().await;
        f(&coordinator)
    }

    /// Current state plus a receiver for every later event, with no gap.
    pub async fn subscribe(&self) -> (Snapshot, broadcast::Receiver<DeploymentEvent>) {
        let coordinator = self.coordinator.lock().await;
        (coordinator.snapshot(), self.publisher.subscribe())
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }
}
