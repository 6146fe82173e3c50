use uuid::Uuid;

use crate::fleet::job::{Job, JobStatus};
use crate::fleet::worker::{CleanStatus, ResetProtocol, Worker};

/// The parts of the assigned job a scan cycle looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobVitals {
    pub id: Uuid,
    pub cookie: String,
    pub status: JobStatus,
}

/// Snapshot of a worker and its current job, taken once per cycle.
///
/// Every decision within a clean or dispatch cycle reads this value instead
/// of going back to the store, so they all agree even if the records change
/// underneath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vitals {
    pub name: String,
    pub url: String,
    pub virtualized: bool,
    pub vm_host: Option<String>,
    pub reset_protocol: ResetProtocol,
    pub clean_status: CleanStatus,
    pub manual: bool,
    pub processors: Vec<String>,
    pub job: Option<JobVitals>,
}

impl Vitals {
    pub fn capture(worker: &Worker, job: Option<&Job>) -> Self {
        Self {
            name: worker.name.clone(),
            url: worker.url.clone(),
            virtualized: worker.virtualized,
            vm_host: worker.vm_host.clone(),
            reset_protocol: worker.reset_protocol,
            clean_status: worker.clean_status,
            manual: worker.manual,
            processors: worker.processors.clone(),
            job: job.map(|j| JobVitals {
                id: j.id,
                cookie: j.cookie.clone(),
                status: j.status,
            }),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.job.is_none()
    }

    /// Host part of the worker URL, used to key per-host transfer limits.
    pub fn host(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        let authority = rest.split('/').next().unwrap_or(rest);
        authority
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(authority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::job::BuildSpec;

    #[test]
    fn capture_without_job() {
        let worker = Worker::new("bob", "http://bob.example:8221/rpc", vec!["amd64".into()]);
        let vitals = Vitals::capture(&worker, None);
        assert_eq!(vitals.name, "bob");
        assert_eq!(vitals.clean_status, CleanStatus::Dirty);
        assert!(vitals.is_idle());
    }

    #[test]
    fn capture_with_job() {
        let worker = Worker::new("bob", "http://bob:8221", vec![]);
        let job = Job::new("cookie-1", BuildSpec::default());
        let vitals = Vitals::capture(&worker, Some(&job));
        let jv = vitals.job.unwrap();
        assert_eq!(jv.id, job.id);
        assert_eq!(jv.cookie, "cookie-1");
        assert_eq!(jv.status, JobStatus::Waiting);
    }

    #[test]
    fn host_strips_scheme_port_and_path() {
        let worker = Worker::new("bob", "http://bob.example:8221/rpc", vec![]);
        assert_eq!(Vitals::capture(&worker, None).host(), "bob.example");

        let worker = Worker::new("bare", "bare-host", vec![]);
        assert_eq!(Vitals::capture(&worker, None).host(), "bare-host");
    }
}
