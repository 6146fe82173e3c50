use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{DispatchError, Result};
use crate::fleet::{CleanStatus, Fleet, ResetProtocol, Vitals};
use crate::proxy::{BuilderStatus, WorkerProxy};

/// A remote step taken while cleaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanAction {
    Resume,
    Echo,
    Status,
    Abort,
    Clean,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanOutcome {
    pub actions: Vec<CleanAction>,
    pub is_clean: bool,
}

/// Brings workers back to a dispatchable state between jobs.
///
/// Virtualized workers are reset by resuming their host, either
/// synchronously or by triggering a reset someone else confirms later.
/// Physical workers are reset through the agent: abort a running build,
/// wait for it to stop, then clean.
#[derive(Clone)]
pub struct Cleaner {
    fleet: Arc<RwLock<Fleet>>,
}

impl Cleaner {
    pub fn new(fleet: Arc<RwLock<Fleet>>) -> Self {
        Self { fleet }
    }

    /// Run one step towards a clean worker.
    ///
    /// Only reports `is_clean` once the reset is verified; the resulting
    /// clean status is written to the store after the remote calls finish.
    pub async fn clean_worker(
        &self,
        vitals: &Vitals,
        proxy: &dyn WorkerProxy,
    ) -> Result<CleanOutcome> {
        if vitals.clean_status == CleanStatus::Clean {
            return Ok(CleanOutcome {
                actions: Vec::new(),
                is_clean: true,
            });
        }

        let mut actions = Vec::new();
        let result = if vitals.virtualized {
            self.reset_virtual(vitals, proxy, &mut actions).await?
        } else {
            self.reset_physical(proxy, &mut actions).await?
        };

        if let Some(status) = result {
            self.fleet
                .write()
                .await
                .set_clean_status(&vitals.name, status)?;
        }

        let is_clean = result == Some(CleanStatus::Clean);
        tracing::debug!(worker = %vitals.name, ?actions, is_clean, "Clean step done");
        Ok(CleanOutcome { actions, is_clean })
    }

    async fn reset_virtual(
        &self,
        vitals: &Vitals,
        proxy: &dyn WorkerProxy,
        actions: &mut Vec<CleanAction>,
    ) -> Result<Option<CleanStatus>> {
        match vitals.reset_protocol {
            ResetProtocol::None => Err(DispatchError::InvalidResetProtocol {
                worker: vitals.name.clone(),
                protocol: vitals.reset_protocol.to_string(),
            }),
            ResetProtocol::Synchronous => {
                proxy.resume().await?;
                actions.push(CleanAction::Resume);
                // The host is back when its agent answers.
                proxy.echo(vec!["ping".to_string()]).await?;
                actions.push(CleanAction::Echo);
                tracing::info!(worker = %vitals.name, "Virtual worker reset");
                Ok(Some(CleanStatus::Clean))
            }
            ResetProtocol::ExternalAsync => {
                if vitals.clean_status == CleanStatus::Cleaning {
                    tracing::debug!(worker = %vitals.name, "Awaiting reset confirmation");
                    return Ok(None);
                }
                proxy.resume().await?;
                actions.push(CleanAction::Resume);
                tracing::info!(worker = %vitals.name, "Virtual worker reset triggered");
                Ok(Some(CleanStatus::Cleaning))
            }
        }
    }

    async fn reset_physical(
        &self,
        proxy: &dyn WorkerProxy,
        actions: &mut Vec<CleanAction>,
    ) -> Result<Option<CleanStatus>> {
        let status = proxy.status().await?;
        actions.push(CleanAction::Status);
        match status.builder_status {
            BuilderStatus::Idle => Ok(Some(CleanStatus::Clean)),
            BuilderStatus::Building => {
                proxy.abort().await?;
                actions.push(CleanAction::Abort);
                tracing::info!(worker = %proxy.name(), "Aborting leftover build");
                Ok(Some(CleanStatus::Dirty))
            }
            BuilderStatus::Aborting => Ok(Some(CleanStatus::Dirty)),
            BuilderStatus::Waiting => {
                proxy.clean().await?;
                actions.push(CleanAction::Clean);
                Ok(Some(CleanStatus::Clean))
            }
        }
    }
}
