use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{DispatchError, Result};
use crate::fleet::{CleanStatus, Fleet, Job, Vitals};
use crate::proxy::{BuilderStatus, WorkerProxy};
use crate::scheduler::behaviour::{BehaviourRegistry, BoundBehaviour};
use crate::scheduler::selector::CandidateSelector;
use crate::transfer::FileStager;

/// Matches clean idle workers with waiting jobs and starts them.
#[derive(Clone)]
pub struct Dispatcher {
    fleet: Arc<RwLock<Fleet>>,
    selector: Arc<dyn CandidateSelector>,
    behaviours: Arc<BehaviourRegistry>,
    stager: FileStager,
}

impl Dispatcher {
    pub fn new(
        fleet: Arc<RwLock<Fleet>>,
        selector: Arc<dyn CandidateSelector>,
        behaviours: Arc<BehaviourRegistry>,
        stager: FileStager,
    ) -> Self {
        Self {
            fleet,
            selector,
            behaviours,
            stager,
        }
    }

    pub fn get_build_behaviour(
        &self,
        job: Option<&Job>,
        vitals: &Vitals,
        proxy: Arc<dyn WorkerProxy>,
    ) -> Result<Option<BoundBehaviour>> {
        self.behaviours.get_build_behaviour(job, vitals, proxy)
    }

    /// Start the next suitable job on a clean idle worker.
    ///
    /// The worker is marked dirty together with the assignment, before any
    /// remote call, so a dispatch that dies half way leaves the worker
    /// unusable rather than falsely clean. If starting fails the worker stays
    /// dirty and the job goes back to the queue, unless the failure lies with
    /// the job itself, in which case it is parked as failed.
    pub async fn find_and_start_job(
        &self,
        vitals: &Vitals,
        proxy: Arc<dyn WorkerProxy>,
    ) -> Result<Option<Job>> {
        if vitals.clean_status != CleanStatus::Clean {
            tracing::error!(worker = %vitals.name, clean_status = %vitals.clean_status, "Refusing dispatch");
            return Err(DispatchError::IsolationViolation {
                worker: vitals.name.clone(),
                reason: "attempted to start a job on a dirty worker".to_string(),
            });
        }
        if let Some(job) = &vitals.job {
            return Err(DispatchError::IsolationViolation {
                worker: vitals.name.clone(),
                reason: format!("worker already runs job {}", job.id),
            });
        }

        let Some(candidate) = self.selector.find_candidate(vitals).await? else {
            tracing::debug!(worker = %vitals.name, "No candidate job");
            return Ok(None);
        };

        let job = self
            .fleet
            .write()
            .await
            .assign_job(&candidate.id, &vitals.name)?;

        match self.start(&job, vitals, proxy).await {
            Ok(()) => {
                let mut fleet = self.fleet.write().await;
                fleet.mark_job_started(&job.id)?;
                let started = fleet.get_job(&job.id).cloned().unwrap_or(job);
                tracing::info!(job_id = %started.id, worker = %vitals.name, build_type = %started.build.build_type, "Job started");
                Ok(Some(started))
            }
            Err(e) if e.is_job_fault() => {
                tracing::warn!(job_id = %job.id, worker = %vitals.name, error = %e, "Dispatch failed, job parked");
                self.fleet.write().await.fail_job(&job.id, e.to_string())?;
                Err(e)
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, worker = %vitals.name, error = %e, "Dispatch failed, job requeued");
                self.fleet.write().await.reset_job(&job.id)?;
                Err(e)
            }
        }
    }

    async fn start(&self, job: &Job, vitals: &Vitals, proxy: Arc<dyn WorkerProxy>) -> Result<()> {
        let behaviour = self
            .get_build_behaviour(Some(job), vitals, proxy.clone())?
            .ok_or(DispatchError::JobNotFound(job.id))?;
        let payload = behaviour.build_command(&self.stager).await?;

        let build_id = job.id.to_string();
        let started = proxy.build(&build_id, &job.cookie, &payload).await?;
        if started.builder_status != BuilderStatus::Building {
            return Err(DispatchError::RemoteFault {
                operation: "build",
                message: format!("worker answered {} instead of BUILDING", started.builder_status),
            });
        }
        if started.build_id != build_id {
            return Err(DispatchError::ProtocolViolation(format!(
                "worker started build {} instead of {}",
                started.build_id, build_id
            )));
        }
        Ok(())
    }
}
