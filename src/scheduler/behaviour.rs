use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{DispatchError, Result};
use crate::fleet::{Job, Vitals};
use crate::proxy::{
    extract_build_status, BuildPayload, BuilderStatus, Credentials, RemoteStatus, WorkerProxy,
};
use crate::transfer::FileStager;

/// What a status poll means for the job on the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Building { logtail: Option<String> },
    Aborting,
    /// The build ended; `build_status` is the bare status name.
    Finished {
        build_status: String,
        filemap: BTreeMap<String, String>,
    },
    /// The worker is idle: it no longer knows about the build.
    Lost,
}

/// Build-type specific knowledge: how to start a job and how to read the
/// worker's reports about it.
#[async_trait]
pub trait BuildBehaviour: Send + Sync {
    fn build_type(&self) -> &str;

    /// Stage the job's inputs on the worker and assemble the build payload.
    async fn build_command(
        &self,
        job: &Job,
        vitals: &Vitals,
        proxy: Arc<dyn WorkerProxy>,
        stager: &FileStager,
    ) -> Result<BuildPayload>;

    fn on_status(&self, job: &Job, status: &RemoteStatus) -> Result<BuildOutcome>;
}

/// A behaviour bound to the job, worker and proxy it acts on.
pub struct BoundBehaviour {
    behaviour: Arc<dyn BuildBehaviour>,
    job: Job,
    vitals: Vitals,
    proxy: Arc<dyn WorkerProxy>,
}

impl BoundBehaviour {
    pub fn build_type(&self) -> &str {
        self.behaviour.build_type()
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub async fn build_command(&self, stager: &FileStager) -> Result<BuildPayload> {
        self.behaviour
            .build_command(&self.job, &self.vitals, self.proxy.clone(), stager)
            .await
    }

    pub fn on_status(&self, status: &RemoteStatus) -> Result<BuildOutcome> {
        self.behaviour.on_status(&self.job, status)
    }
}

/// Build type name to behaviour.
#[derive(Default, Clone)]
pub struct BehaviourRegistry {
    behaviours: HashMap<String, Arc<dyn BuildBehaviour>>,
}

impl BehaviourRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, behaviour: Arc<dyn BuildBehaviour>) -> Self {
        self.behaviours
            .insert(behaviour.build_type().to_string(), behaviour);
        self
    }

    pub fn resolve(&self, build_type: &str) -> Result<Arc<dyn BuildBehaviour>> {
        self.behaviours
            .get(build_type)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownBuildType(build_type.to_string()))
    }

    /// Resolve the behaviour for `job` and bind it to the worker and proxy.
    /// No job, no behaviour.
    pub fn get_build_behaviour(
        &self,
        job: Option<&Job>,
        vitals: &Vitals,
        proxy: Arc<dyn WorkerProxy>,
    ) -> Result<Option<BoundBehaviour>> {
        let Some(job) = job else {
            return Ok(None);
        };
        let behaviour = self.resolve(&job.build.build_type)?;
        Ok(Some(BoundBehaviour {
            behaviour,
            job: job.clone(),
            vitals: vitals.clone(),
            proxy,
        }))
    }
}

/// Behaviour for build types whose payload is just staged inputs and
/// arguments: the chroot, the input files by name, and the job's args.
pub struct StagedBuildBehaviour {
    build_type: String,
    credentials: Option<Credentials>,
}

impl StagedBuildBehaviour {
    pub fn new(build_type: impl Into<String>) -> Self {
        Self {
            build_type: build_type.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

#[async_trait]
impl BuildBehaviour for StagedBuildBehaviour {
    fn build_type(&self) -> &str {
        &self.build_type
    }

    async fn build_command(
        &self,
        job: &Job,
        vitals: &Vitals,
        proxy: Arc<dyn WorkerProxy>,
        stager: &FileStager,
    ) -> Result<BuildPayload> {
        let chroot = job.build.chroot.as_ref().ok_or_else(|| {
            DispatchError::Config(format!("job {} has no chroot", job.id))
        })?;
        if let Some(processor) = &job.processor {
            if !vitals.processors.iter().any(|p| p == processor) {
                return Err(DispatchError::Config(format!(
                    "worker {} cannot build for {}",
                    vitals.name, processor
                )));
            }
        }

        let mut inputs = Vec::with_capacity(job.build.files.len() + 1);
        inputs.push(chroot.clone());
        inputs.extend(job.build.files.iter().cloned());
        stager
            .stage_inputs(proxy, vitals.host(), &inputs, self.credentials.clone())
            .await?;

        let mut args = job.build.args.clone();
        if let Some(processor) = &job.processor {
            args.insert("arch_tag".to_string(), processor.clone());
        }

        Ok(BuildPayload {
            build_type: self.build_type.clone(),
            chroot_sha1: chroot.sha1.clone(),
            filemap: job
                .build
                .files
                .iter()
                .map(|f| (f.filename.clone(), f.sha1.clone()))
                .collect(),
            args,
        })
    }

    fn on_status(&self, job: &Job, status: &RemoteStatus) -> Result<BuildOutcome> {
        if let Some(build_id) = &status.build_id {
            if *build_id != job.id.to_string() {
                return Err(DispatchError::ProtocolViolation(format!(
                    "worker reports build {} but job {} is assigned",
                    build_id, job.id
                )));
            }
        }
        match status.builder_status {
            BuilderStatus::Building => Ok(BuildOutcome::Building {
                logtail: status.logtail.clone(),
            }),
            BuilderStatus::Aborting => Ok(BuildOutcome::Aborting),
            BuilderStatus::Idle => Ok(BuildOutcome::Lost),
            BuilderStatus::Waiting => {
                let build_status = extract_build_status(status)?.ok_or_else(|| {
                    DispatchError::ProtocolViolation(
                        "WAITING status without build_status".to_string(),
                    )
                })?;
                Ok(BuildOutcome::Finished {
                    build_status: build_status.to_string(),
                    filemap: status.filemap.clone(),
                })
            }
        }
    }
}
