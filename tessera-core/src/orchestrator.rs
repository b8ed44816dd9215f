//! Node lifecycle.
//!
//! The orchestrator owns the ordered list of node services. `start` brings
//! them up front to back, `stop` tears them down back to front:
//!
//! ```text
//! start:  StorageService -> IngestionService -> SnapshotSource
//! stop:   SnapshotSource -> IngestionService -> StorageService
//! ```

use crate::error::{Result, TesseraError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// A component with a start/stop lifecycle driven by the orchestrator.
#[async_trait]
pub trait NodeService: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Started,
}

pub struct ServiceOrchestrator {
    services: Vec<Arc<dyn NodeService>>,
    state: Mutex<LifecycleState>,
}

impl ServiceOrchestrator {
    pub fn new(services: Vec<Arc<dyn NodeService>>) -> Self {
        Self {
            services,
            state: Mutex::new(LifecycleState::NotStarted),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|service| service.name()).collect()
    }

    /// Starts every service in declared order.
    ///
    /// The node counts as started as soon as the transition is taken, so a
    /// failure part way leaves the services already running; `stop` tears
    /// those down.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted` when called twice
    /// - the first service start error
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == LifecycleState::Started {
            return Err(TesseraError::AlreadyStarted);
        }
        *state = LifecycleState::Started;

        for service in &self.services {
            info!("Starting service {}", service.name());
            if let Err(e) = service.start().await {
                error!("Failed to start service {}: {}", service.name(), e);
                return Err(e);
            }
        }

        info!("Node started with {} services", self.services.len());
        Ok(())
    }

    /// Stops every service in reverse order.
    ///
    /// Every service gets a stop attempt; failures are collected and returned
    /// as one `ShutdownFailed` once all attempts ran. Stopping a node that is
    /// not started is a logged no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == LifecycleState::NotStarted {
            warn!("Node already stopped, ignoring duplicate attempt");
            return Ok(());
        }

        let mut failed = Vec::new();
        let mut first_error = None;
        for service in self.services.iter().rev() {
            info!("Stopping service {}", service.name());
            if let Err(e) = service.stop().await {
                error!("Failed to stop service {}: {}", service.name(), e);
                failed.push(service.name().to_string());
                first_error.get_or_insert(e);
            }
        }

        *state = LifecycleState::NotStarted;

        match first_error {
            None => {
                info!("Node stopped");
                Ok(())
            }
            Some(first) => Err(TesseraError::ShutdownFailed {
                failed,
                first: Box::new(first),
            }),
        }
    }
}
