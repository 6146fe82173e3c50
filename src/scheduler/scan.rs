use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::fleet::{CleanStatus, Fleet, Job, JobStatus, JobVitals, Vitals};
use crate::proxy::{BuilderStatus, ProxySource, WorkerProxy};
use crate::scheduler::behaviour::{BehaviourRegistry, BuildOutcome};
use crate::scheduler::cleaner::{CleanOutcome, Cleaner};
use crate::scheduler::dispatcher::Dispatcher;
use crate::transfer::FileStager;

/// What one scan did to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Disabled by an operator or a previous fault.
    Skipped,
    /// Polled the build running on the worker.
    Polled(BuildOutcome),
    /// Ran a clean step; the worker is not clean yet.
    Cleaning(CleanOutcome),
    /// The worker was clean (possibly just now); `job` is what got started.
    Dispatched { job: Option<Uuid> },
}

/// Periodic pass over the whole fleet.
///
/// Each tick every enabled worker is scanned concurrently: a worker with a
/// job has its build polled, a worker that is not clean gets one clean step,
/// and a clean idle worker gets a dispatch attempt.
#[derive(Clone)]
pub struct FleetScanner {
    fleet: Arc<RwLock<Fleet>>,
    proxies: Arc<dyn ProxySource>,
    cleaner: Cleaner,
    dispatcher: Dispatcher,
    behaviours: Arc<BehaviourRegistry>,
    stager: FileStager,
    results_dir: PathBuf,
    interval: Duration,
    max_failures: u32,
}

impl FleetScanner {
    pub fn new(
        fleet: Arc<RwLock<Fleet>>,
        proxies: Arc<dyn ProxySource>,
        dispatcher: Dispatcher,
        behaviours: Arc<BehaviourRegistry>,
        stager: FileStager,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            cleaner: Cleaner::new(fleet.clone()),
            fleet,
            proxies,
            dispatcher,
            behaviours,
            stager,
            results_dir: config.results_dir.clone(),
            interval: config.scan_interval,
            max_failures: config.max_failures,
        }
    }

    /// Scan on every tick until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        tracing::info!(interval = ?self.interval, "Fleet scanner started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Fleet scanner stopping");
                    break;
                }
                _ = interval.tick() => {
                    let results = self.scan_all().await;
                    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                    tracing::debug!(workers = results.len(), failed, "Scan finished");
                }
            }
        }
    }

    /// Scan every worker once, concurrently, and account for failures.
    pub async fn scan_all(&self) -> Vec<(String, Result<ScanOutcome>)> {
        let names = self.fleet.read().await.worker_names();

        let mut tasks = JoinSet::new();
        for name in names {
            let scanner = self.clone();
            tasks.spawn(async move {
                let result = scanner.scan_worker(&name).await;
                scanner.account(&name, &result).await;
                (name, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => tracing::error!(error = %e, "Scan task panicked"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// One scan step for one worker.
    pub async fn scan_worker(&self, name: &str) -> Result<ScanOutcome> {
        let vitals = self.fleet.read().await.get_vitals(name)?;
        if vitals.manual {
            return Ok(ScanOutcome::Skipped);
        }
        let proxy = self.proxies.proxy_for(&vitals).await?;

        if let Some(job) = &vitals.job {
            let outcome = self.update_build(&vitals, job, proxy).await?;
            return Ok(ScanOutcome::Polled(outcome));
        }

        if vitals.clean_status != CleanStatus::Clean {
            let outcome = self.cleaner.clean_worker(&vitals, proxy.as_ref()).await?;
            if !outcome.is_clean {
                return Ok(ScanOutcome::Cleaning(outcome));
            }
        }

        // Fresh snapshot: cleaning above may have changed the status.
        let vitals = self.fleet.read().await.get_vitals(name)?;
        let job = self.dispatcher.find_and_start_job(&vitals, proxy).await?;
        Ok(ScanOutcome::Dispatched {
            job: job.map(|j| j.id),
        })
    }

    async fn update_build(
        &self,
        vitals: &Vitals,
        job_vitals: &JobVitals,
        proxy: Arc<dyn WorkerProxy>,
    ) -> Result<BuildOutcome> {
        let job = self
            .fleet
            .read()
            .await
            .get_job(&job_vitals.id)
            .cloned()
            .ok_or(DispatchError::JobNotFound(job_vitals.id))?;

        let status = proxy.status().await?;
        let behaviour = self
            .behaviours
            .get_build_behaviour(Some(&job), vitals, proxy.clone())?
            .ok_or(DispatchError::JobNotFound(job.id))?;
        let outcome = behaviour.on_status(&status)?;

        match &outcome {
            BuildOutcome::Building { logtail } => {
                if let Some(logtail) = logtail {
                    self.fleet
                        .write()
                        .await
                        .update_logtail(&job.id, logtail.clone())?;
                }
                if job_vitals.status == JobStatus::Cancelling
                    && status.builder_status == BuilderStatus::Building
                {
                    tracing::info!(job_id = %job.id, worker = %vitals.name, "Cancelling build");
                    proxy.abort().await?;
                }
            }
            BuildOutcome::Aborting => {}
            BuildOutcome::Finished {
                build_status,
                filemap,
            } => {
                tracing::info!(job_id = %job.id, worker = %vitals.name, build_status = %build_status, files = filemap.len(), "Build finished");
                // The job stays assigned until its outputs are safely here,
                // so a failed fetch is retried on the next scan.
                self.collect_outputs(vitals, &job, filemap, proxy).await?;
                self.fleet.write().await.retire_job(&job.id);
            }
            BuildOutcome::Lost => {
                tracing::warn!(job_id = %job.id, worker = %vitals.name, "Worker lost the build, requeueing");
                let mut fleet = self.fleet.write().await;
                fleet.reset_job(&job.id)?;
                fleet.set_clean_status(&vitals.name, CleanStatus::Dirty)?;
            }
        }
        Ok(outcome)
    }

    /// Fetch a finished build's files into `<results_dir>/<job id>/`.
    async fn collect_outputs(
        &self,
        vitals: &Vitals,
        job: &Job,
        filemap: &BTreeMap<String, String>,
        proxy: Arc<dyn WorkerProxy>,
    ) -> Result<()> {
        if filemap.is_empty() {
            return Ok(());
        }
        let dir = self.results_dir.join(job.id.to_string());
        let mut files = Vec::with_capacity(filemap.len());
        for (name, sha1) in filemap {
            if Path::new(name).file_name() != Some(OsStr::new(name)) {
                return Err(DispatchError::ProtocolViolation(format!(
                    "worker reported output file {:?} outside the build directory",
                    name
                )));
            }
            files.push((sha1.clone(), dir.join(name)));
        }
        tokio::fs::create_dir_all(&dir).await?;
        self.stager.get_files(proxy, vitals.host(), files).await?;
        tracing::info!(job_id = %job.id, dir = %dir.display(), files = filemap.len(), "Build outputs collected");
        Ok(())
    }

    /// Record how a scan went against the worker's failure count.
    async fn account(&self, name: &str, result: &Result<ScanOutcome>) {
        let mut fleet = self.fleet.write().await;
        let recorded = match result {
            Ok(ScanOutcome::Skipped) => Ok(()),
            Ok(_) => fleet.reset_failures(name),
            Err(DispatchError::WorkerNotFound(_)) => Ok(()),
            Err(e) if e.is_job_fault() => {
                tracing::warn!(worker = %name, error = %e, "Scan failed on a job fault");
                Ok(())
            }
            Err(e) if e.needs_manual_intervention() => {
                tracing::error!(worker = %name, error = %e, "Worker fault");
                fleet.disable_worker(name, e.to_string())
            }
            Err(e) => {
                tracing::warn!(worker = %name, error = %e, "Scan failed");
                match fleet.record_failure(name, e.to_string()) {
                    Ok(count) if count >= self.max_failures => {
                        fleet.disable_worker(name, format!("{} consecutive failures: {}", count, e))
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = recorded {
            tracing::warn!(worker = %name, error = %e, "Could not record scan result");
        }
    }
}
