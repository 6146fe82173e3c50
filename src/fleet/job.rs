use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Waiting,
    Running,
    Cancelling,
    /// Parked after a dispatch that can never succeed; never offered again.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Cancelling => write!(f, "cancelling"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A build input the worker must hold before the build starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub sha1: String,
    pub filename: String,
    /// Where the worker can download it from. `None` means the worker must
    /// already have it cached.
    pub url: Option<String>,
}

impl InputFile {
    pub fn new(sha1: impl Into<String>, filename: impl Into<String>, url: Option<String>) -> Self {
        Self {
            sha1: sha1.into(),
            filename: filename.into(),
            url,
        }
    }
}

/// What the build-type behaviour needs to turn a job into a payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
    pub build_type: String,
    pub chroot: Option<InputFile>,
    pub files: Vec<InputFile>,
    pub args: BTreeMap<String, String>,
}

/// Build queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Correlates this job with its build record on the worker.
    pub cookie: String,
    pub status: JobStatus,
    pub score: i64,
    /// Required processor family; `None` builds anywhere.
    pub processor: Option<String>,
    pub virtualized: bool,
    pub assigned_worker: Option<String>,
    pub build: BuildSpec,
    pub logtail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Why the job was parked, when it is `Failed`.
    #[serde(default)]
    pub failure_notes: Option<String>,
}

impl Job {
    pub fn new(cookie: impl Into<String>, build: BuildSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            cookie: cookie.into(),
            status: JobStatus::Waiting,
            score: 0,
            processor: None,
            virtualized: false,
            assigned_worker: None,
            build,
            logtail: None,
            created_at: Utc::now(),
            started_at: None,
            failure_notes: None,
        }
    }

    pub fn with_score(mut self, score: i64) -> Self {
        self.score = score;
        self
    }

    pub fn for_processor(mut self, processor: impl Into<String>) -> Self {
        self.processor = Some(processor.into());
        self
    }

    pub fn requiring_virtualization(mut self) -> Self {
        self.virtualized = true;
        self
    }
}
