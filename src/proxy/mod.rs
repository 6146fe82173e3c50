//! Client side of the worker-agent protocol.
//!
//! [`WorkerProxy`] is the one interface the cleaner, dispatcher and file
//! transfer code use to talk to a worker. Every call is bounded by a timeout;
//! when it expires the call is dropped and the caller gets
//! [`DispatchError::Cancelled`]. The remote side may or may not have acted on
//! a cancelled call, so non-idempotent operations such as `build` must not be
//! retried without checking `status` first.

pub mod factory;
pub mod grpc;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::error::{DispatchError, Result};

pub use factory::{ProxyFactory, ProxySource};
pub use grpc::GrpcWorkerProxy;

/// What the agent reports it is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderStatus {
    Idle,
    Building,
    /// A build finished and its results are waiting to be collected.
    Waiting,
    Aborting,
}

impl std::fmt::Display for BuilderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuilderStatus::Idle => write!(f, "IDLE"),
            BuilderStatus::Building => write!(f, "BUILDING"),
            BuilderStatus::Waiting => write!(f, "WAITING"),
            BuilderStatus::Aborting => write!(f, "ABORTING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub builder_status: BuilderStatus,
    pub build_id: Option<String>,
    /// Dotted constant as sent by the agent, e.g. `BuildStatus.OK`.
    pub build_status: Option<String>,
    pub logtail: Option<String>,
    /// Result file name to content hash.
    pub filemap: BTreeMap<String, String>,
    pub dependencies: Option<String>,
}

impl RemoteStatus {
    pub fn new(builder_status: BuilderStatus) -> Self {
        Self {
            builder_status,
            build_id: None,
            build_status: None,
            logtail: None,
            filemap: BTreeMap::new(),
            dependencies: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub protocol_version: String,
    pub arch_tag: String,
    pub build_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsurePresent {
    pub present: bool,
    pub outcome: String,
}

/// Credentials the worker should use against the content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Everything the agent needs to start a build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildPayload {
    pub build_type: String,
    pub chroot_sha1: String,
    /// Input file name to content hash.
    pub filemap: BTreeMap<String, String>,
    pub args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStarted {
    pub builder_status: BuilderStatus,
    pub build_id: String,
}

#[async_trait]
pub trait WorkerProxy: Send + Sync {
    /// Name of the worker this proxy talks to.
    fn name(&self) -> &str;

    async fn echo(&self, args: Vec<String>) -> Result<Vec<String>>;

    async fn info(&self) -> Result<WorkerInfo>;

    async fn status(&self) -> Result<RemoteStatus>;

    /// Valid only while BUILDING; the agent moves through ABORTING to WAITING.
    async fn abort(&self) -> Result<()>;

    /// Valid only while WAITING; returns the agent to IDLE.
    async fn clean(&self) -> Result<()>;

    /// Ask the worker to make sure it holds `sha1`, downloading it from `url`
    /// if needed. Bounded by five call timeouts.
    async fn ensure_present(
        &self,
        sha1: &str,
        url: Option<&str>,
        credentials: Option<&Credentials>,
    ) -> Result<EnsurePresent>;

    /// Stream the worker's copy of `sha1` into `sink`. Returns bytes written.
    async fn fetch_file(&self, sha1: &str, sink: &mut (dyn AsyncWrite + Send + Unpin))
        -> Result<u64>;

    async fn build(&self, build_id: &str, cookie: &str, payload: &BuildPayload)
        -> Result<BuildStarted>;

    /// Resume or reset the worker's virtual host. Returns stdout and stderr
    /// of the resume command.
    async fn resume(&self) -> Result<(String, String)>;
}

/// Bare name of the `build_status` constant in a status report.
///
/// The agent sends dotted constants such as `BuildStatus.OK`; this returns
/// `OK`. A report without a build status yields `None`. An undotted value
/// breaks the protocol contract and is never worth retrying.
pub fn extract_build_status(status: &RemoteStatus) -> Result<Option<&str>> {
    let Some(raw) = status.build_status.as_deref() else {
        return Ok(None);
    };
    match raw.rsplit_once('.') {
        Some((_, name)) if !name.is_empty() => Ok(Some(name)),
        _ => Err(DispatchError::ProtocolViolation(format!(
            "build_status {:?} is not a dotted constant",
            raw
        ))),
    }
}
