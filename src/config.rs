use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DispatchError, Result};
use crate::fleet::{BuildSpec, InputFile, Job, ResetProtocol, Worker};

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// `ensure_present` may make the worker download from the content store,
/// so it gets this many call timeouts.
pub const ENSURE_PRESENT_TIMEOUT_FACTOR: u32 = 5;

/// Command used to resume or reset a virtual host.
///
/// Every argument may contain `{worker_name}` and `{vm_host}` placeholders,
/// substituted per worker before the command is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeConfig {
    pub argv: Vec<String>,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            argv: vec![
                "ssh".to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "builder@{vm_host}".to_string(),
                "reset-builder".to_string(),
                "{worker_name}".to_string(),
            ],
        }
    }
}

impl ResumeConfig {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// Substitute the placeholders for one worker.
    pub fn render(&self, worker_name: &str, vm_host: &str) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{worker_name}", worker_name)
                    .replace("{vm_host}", vm_host)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Bounds transport establishment with a worker agent.
    pub connection_timeout: Duration,
    /// Bounds the full round trip of one call.
    pub call_timeout: Duration,
    pub resume: ResumeConfig,
    /// Concurrent file transfers allowed per remote host.
    pub transfer_pool_size: usize,
    pub scan_interval: Duration,
    /// Consecutive transport failures before a worker is disabled.
    pub max_failures: u32,
    /// Finished builds' output files land under `<results_dir>/<job id>/`.
    pub results_dir: PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            resume: ResumeConfig::default(),
            transfer_pool_size: 10,
            scan_interval: Duration::from_secs(15),
            max_failures: 5,
            results_dir: PathBuf::from("results"),
        }
    }
}

impl DispatchConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_resume(mut self, resume: ResumeConfig) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_transfer_pool_size(mut self, size: usize) -> Self {
        self.transfer_pool_size = size;
        self
    }

    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    pub fn ensure_present_timeout(&self) -> Duration {
        self.call_timeout * ENSURE_PRESENT_TIMEOUT_FACTOR
    }

    pub fn validate(&self) -> Result<()> {
        if self.resume.argv.is_empty() {
            return Err(DispatchError::Config(
                "resume command template is empty".to_string(),
            ));
        }
        if self.transfer_pool_size == 0 {
            return Err(DispatchError::Config(
                "transfer pool size must be at least 1".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(DispatchError::Config(
                "call timeout must be positive".to_string(),
            ));
        }
        if self.results_dir.as_os_str().is_empty() {
            return Err(DispatchError::Config("results directory is empty".to_string()));
        }
        Ok(())
    }
}

/// One worker entry in the fleet definition file.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub virtualized: bool,
    #[serde(default)]
    pub vm_host: Option<String>,
    #[serde(default)]
    pub reset_protocol: ResetProtocol,
    #[serde(default)]
    pub processors: Vec<String>,
    #[serde(default)]
    pub manual: bool,
}

/// A job to seed the queue with at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    pub cookie: String,
    pub build_type: String,
    pub chroot: InputFile,
    #[serde(default)]
    pub files: Vec<InputFile>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub processor: Option<String>,
    #[serde(default)]
    pub virtualized: bool,
}

impl JobEntry {
    pub fn into_job(self) -> Job {
        let mut job = Job::new(
            self.cookie,
            BuildSpec {
                build_type: self.build_type,
                chroot: Some(self.chroot),
                files: self.files,
                args: self.args,
            },
        )
        .with_score(self.score);
        if let Some(processor) = self.processor {
            job = job.for_processor(processor);
        }
        if self.virtualized {
            job = job.requiring_virtualization();
        }
        job
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetFile {
    pub workers: Vec<WorkerEntry>,
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

impl FleetFile {
    pub fn parse(text: &str) -> Result<Self> {
        let fleet: FleetFile = serde_json::from_str(text)?;
        for entry in &fleet.workers {
            if entry.virtualized && entry.vm_host.as_deref().unwrap_or("").is_empty() {
                return Err(DispatchError::Config(format!(
                    "virtualized worker {} has no vm_host",
                    entry.name
                )));
            }
        }
        Ok(fleet)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    pub fn into_parts(self) -> (Vec<Worker>, Vec<Job>) {
        let jobs = self.jobs.into_iter().map(JobEntry::into_job).collect();
        (Self::build_workers(self.workers), jobs)
    }

    fn build_workers(entries: Vec<WorkerEntry>) -> Vec<Worker> {
        entries
            .into_iter()
            .map(|e| {
                let mut worker = Worker::new(e.name, e.url, e.processors);
                if e.virtualized {
                    worker = worker.virtualized(e.vm_host.unwrap_or_default(), e.reset_protocol);
                }
                worker.manual = e.manual;
                worker
            })
            .collect()
    }
}
