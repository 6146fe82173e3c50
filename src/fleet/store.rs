use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::fleet::job::{Job, JobStatus};
use crate::fleet::vitals::Vitals;
use crate::fleet::worker::{CleanStatus, Worker};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// In-memory worker and job records.
#[derive(Debug)]
pub struct Fleet {
    workers: HashMap<String, Worker>,
    jobs: HashMap<Uuid, Job>,
    max_jobs: usize,
}

impl Default for Fleet {
    fn default() -> Self {
        Self::new()
    }
}

impl Fleet {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            workers: HashMap::new(),
            jobs: HashMap::new(),
            max_jobs,
        }
    }

    pub fn add_worker(&mut self, worker: Worker) {
        tracing::info!(worker = %worker.name, virtualized = worker.virtualized, "Worker added");
        self.workers.insert(worker.name.clone(), worker);
    }

    pub fn get_worker(&self, name: &str) -> Option<&Worker> {
        self.workers.get(name)
    }

    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Add a job to the queue. Returns false if the queue is at capacity.
    pub fn add_job(&mut self, job: Job) -> bool {
        if self.jobs.len() >= self.max_jobs {
            return false;
        }
        self.jobs.insert(job.id, job);
        true
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn job_for_worker(&self, name: &str) -> Option<&Job> {
        self.jobs
            .values()
            .find(|j| j.assigned_worker.as_deref() == Some(name))
    }

    /// Snapshot a worker and its assigned job.
    pub fn get_vitals(&self, name: &str) -> Result<Vitals> {
        let worker = self
            .workers
            .get(name)
            .ok_or_else(|| DispatchError::WorkerNotFound(name.to_string()))?;
        Ok(Vitals::capture(worker, self.job_for_worker(name)))
    }

    /// Snapshot every worker, sorted by name.
    pub fn vitals_for_all(&self) -> Vec<Vitals> {
        self.worker_names()
            .iter()
            .filter_map(|name| self.get_vitals(name).ok())
            .collect()
    }

    pub fn set_clean_status(&mut self, name: &str, status: CleanStatus) -> Result<()> {
        let worker = self.worker_mut(name)?;
        if worker.clean_status != status {
            tracing::debug!(worker = %name, from = %worker.clean_status, to = %status, "Clean status changed");
            worker.clean_status = status;
        }
        Ok(())
    }

    /// Out-of-band confirmation that an asynchronous reset finished.
    ///
    /// Only moves CLEANING to CLEAN; returns false for any other state.
    pub fn confirm_clean(&mut self, name: &str) -> Result<bool> {
        let worker = self.worker_mut(name)?;
        if worker.clean_status != CleanStatus::Cleaning {
            return Ok(false);
        }
        worker.clean_status = CleanStatus::Clean;
        tracing::info!(worker = %name, "Asynchronous reset confirmed");
        Ok(true)
    }

    /// Waiting jobs the worker can take, best score first, oldest first on ties.
    pub fn candidates(&self, vitals: &Vitals) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Waiting && j.assigned_worker.is_none())
            .filter(|j| j.virtualized == vitals.virtualized)
            .filter(|j| match &j.processor {
                Some(p) => vitals.processors.iter().any(|wp| wp == p),
                None => true,
            })
            .collect();
        jobs.sort_by(|a, b| b.score.cmp(&a.score).then(a.created_at.cmp(&b.created_at)));
        jobs
    }

    /// Hand a job to a worker, marking the worker dirty in the same step.
    ///
    /// The worker must be clean and idle, and the job unassigned.
    pub fn assign_job(&mut self, job_id: &Uuid, name: &str) -> Result<Job> {
        if self.job_for_worker(name).is_some() {
            return Err(DispatchError::IsolationViolation {
                worker: name.to_string(),
                reason: "worker already has a job".to_string(),
            });
        }
        let worker = self
            .workers
            .get(name)
            .ok_or_else(|| DispatchError::WorkerNotFound(name.to_string()))?;
        if worker.clean_status != CleanStatus::Clean {
            return Err(DispatchError::IsolationViolation {
                worker: name.to_string(),
                reason: "attempted to start a job on a dirty worker".to_string(),
            });
        }
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or(DispatchError::JobNotFound(*job_id))?;
        if job.assigned_worker.is_some() {
            return Err(DispatchError::IsolationViolation {
                worker: name.to_string(),
                reason: format!("job {} is already assigned", job_id),
            });
        }
        job.assigned_worker = Some(name.to_string());
        let assigned = job.clone();
        self.worker_mut(name)?.clean_status = CleanStatus::Dirty;
        tracing::info!(job_id = %job_id, worker = %name, "Job assigned");
        Ok(assigned)
    }

    pub fn mark_job_started(&mut self, job_id: &Uuid) -> Result<()> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or(DispatchError::JobNotFound(*job_id))?;
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        Ok(())
    }

    /// Return a job to the queue after a failed dispatch. The worker it was
    /// assigned to stays dirty.
    pub fn reset_job(&mut self, job_id: &Uuid) -> Result<()> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or(DispatchError::JobNotFound(*job_id))?;
        job.status = JobStatus::Waiting;
        job.assigned_worker = None;
        job.started_at = None;
        job.logtail = None;
        Ok(())
    }

    /// Park a job whose dispatch can never succeed as it stands. It leaves
    /// the queue without being removed, so an operator can see why.
    pub fn fail_job(&mut self, job_id: &Uuid, note: String) -> Result<()> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or(DispatchError::JobNotFound(*job_id))?;
        job.status = JobStatus::Failed;
        job.assigned_worker = None;
        job.started_at = None;
        job.logtail = None;
        tracing::warn!(job_id = %job_id, cookie = %job.cookie, reason = %note, "Job failed");
        job.failure_notes = Some(note);
        Ok(())
    }

    pub fn request_cancel(&mut self, job_id: &Uuid) -> Result<()> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or(DispatchError::JobNotFound(*job_id))?;
        job.status = JobStatus::Cancelling;
        Ok(())
    }

    pub fn update_logtail(&mut self, job_id: &Uuid, logtail: String) -> Result<()> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or(DispatchError::JobNotFound(*job_id))?;
        job.logtail = Some(logtail);
        Ok(())
    }

    /// Remove a finished job. Its worker keeps whatever clean status it had,
    /// which after a build is always dirty.
    pub fn retire_job(&mut self, job_id: &Uuid) -> Option<Job> {
        let job = self.jobs.remove(job_id);
        if let Some(ref job) = job {
            tracing::info!(job_id = %job_id, worker = ?job.assigned_worker, "Job retired");
        }
        job
    }

    /// Count a failed scan. Returns the new consecutive failure count.
    pub fn record_failure(&mut self, name: &str, note: String) -> Result<u32> {
        let worker = self.worker_mut(name)?;
        worker.failure_count += 1;
        worker.failure_notes = Some(note);
        Ok(worker.failure_count)
    }

    pub fn reset_failures(&mut self, name: &str) -> Result<()> {
        let worker = self.worker_mut(name)?;
        worker.failure_count = 0;
        Ok(())
    }

    /// Take a worker out of rotation until an operator looks at it.
    pub fn disable_worker(&mut self, name: &str, note: String) -> Result<()> {
        let worker = self.worker_mut(name)?;
        worker.manual = true;
        worker.failure_notes = Some(note);
        tracing::warn!(worker = %name, "Worker disabled for manual intervention");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn worker_mut(&mut self, name: &str) -> Result<&mut Worker> {
        self.workers
            .get_mut(name)
            .ok_or_else(|| DispatchError::WorkerNotFound(name.to_string()))
    }
}
