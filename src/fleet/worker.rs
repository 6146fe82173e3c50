use serde::{Deserialize, Serialize};

/// How a virtualized worker's host gets back to a known state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetProtocol {
    /// No reset mechanism. A virtualized worker with this protocol can never be cleaned.
    #[default]
    None,
    /// The resume command returns once the host is reset.
    Synchronous,
    /// The resume command only triggers a reset; infrastructure outside this
    /// process confirms it later.
    ExternalAsync,
}

impl std::fmt::Display for ResetProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetProtocol::None => write!(f, "none"),
            ResetProtocol::Synchronous => write!(f, "synchronous"),
            ResetProtocol::ExternalAsync => write!(f, "external_async"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanStatus {
    Clean,
    Dirty,
    /// An asynchronous reset was triggered and is awaiting confirmation.
    Cleaning,
}

impl std::fmt::Display for CleanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanStatus::Clean => write!(f, "clean"),
            CleanStatus::Dirty => write!(f, "dirty"),
            CleanStatus::Cleaning => write!(f, "cleaning"),
        }
    }
}

/// Durable worker record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub url: String,
    pub virtualized: bool,
    pub vm_host: Option<String>,
    pub reset_protocol: ResetProtocol,
    pub clean_status: CleanStatus,
    /// Processor families this worker can build for.
    pub processors: Vec<String>,
    /// Disabled by an operator or after a fault; skipped by scans.
    pub manual: bool,
    pub failure_count: u32,
    pub failure_notes: Option<String>,
}

impl Worker {
    /// A physical worker. New workers start dirty: nothing is known about
    /// their state until a clean cycle has run.
    pub fn new(name: impl Into<String>, url: impl Into<String>, processors: Vec<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            virtualized: false,
            vm_host: None,
            reset_protocol: ResetProtocol::None,
            clean_status: CleanStatus::Dirty,
            processors,
            manual: false,
            failure_count: 0,
            failure_notes: None,
        }
    }

    pub fn virtualized(mut self, vm_host: impl Into<String>, protocol: ResetProtocol) -> Self {
        self.virtualized = true;
        self.vm_host = Some(vm_host.into());
        self.reset_protocol = protocol;
        self
    }

    pub fn with_clean_status(mut self, status: CleanStatus) -> Self {
        self.clean_status = status;
        self
    }
}
