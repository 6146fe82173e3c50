use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::ResumeConfig;
use crate::error::{DispatchError, ResumeFailure, Result};
use crate::fleet::Vitals;

const SIGKILL: i32 = 9;

/// Resumes and resets the hosts behind virtualized workers.
///
/// Physical workers never come through here: they are reset purely through
/// the agent protocol (abort, then clean).
#[derive(Debug, Clone)]
pub struct HostController {
    resume: ResumeConfig,
    timeout: Duration,
}

impl HostController {
    pub fn new(resume: ResumeConfig, timeout: Duration) -> Self {
        Self { resume, timeout }
    }

    /// Run the resume command for a virtualized worker.
    ///
    /// Fails with [`DispatchError::CannotResume`] without spawning anything if
    /// the worker is not virtualized or has no host address. Returns the
    /// command's stdout and stderr on success.
    pub async fn resume_host(&self, vitals: &Vitals) -> Result<(String, String)> {
        if !vitals.virtualized {
            return Err(DispatchError::CannotResume {
                worker: vitals.name.clone(),
                reason: "not virtualized".to_string(),
            });
        }
        let vm_host = match vitals.vm_host.as_deref() {
            Some(host) if !host.is_empty() => host,
            _ => {
                return Err(DispatchError::CannotResume {
                    worker: vitals.name.clone(),
                    reason: "no vm_host".to_string(),
                })
            }
        };

        let argv = self.resume.render(&vitals.name, vm_host);
        let Some((program, args)) = argv.split_first() else {
            return Err(DispatchError::CannotResume {
                worker: vitals.name.clone(),
                reason: "resume command template is empty".to_string(),
            });
        };

        tracing::info!(worker = %vitals.name, vm_host, command = ?argv, "Resuming host");

        let failed = |detail: ResumeFailure| DispatchError::ResumeFailed {
            worker: vitals.name.clone(),
            detail,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(ResumeFailure::Spawn(e.to_string())))?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let finished = timeout(self.timeout, async {
            tokio::join!(child.wait(), read_all(&mut stdout), read_all(&mut stderr))
        })
        .await;

        let (status, out, err) = match finished {
            Ok((status, out, err)) => (status?, out, err),
            Err(_) => {
                tracing::warn!(worker = %vitals.name, timeout = ?self.timeout, "Resume command timed out, killing it");
                child.kill().await?;
                let signal = child
                    .wait()
                    .await
                    .ok()
                    .and_then(|s| s.signal())
                    .unwrap_or(SIGKILL);
                return Err(failed(ResumeFailure::Killed { signal }));
            }
        };

        if status.success() {
            tracing::info!(worker = %vitals.name, "Host resumed");
            return Ok((out, err));
        }

        let detail = match status.code() {
            Some(code) => ResumeFailure::Exited {
                code,
                stdout: out,
                stderr: err,
            },
            None => ResumeFailure::Signalled {
                signal: status.signal().unwrap_or_default(),
            },
        };
        tracing::error!(worker = %vitals.name, failure = %detail, "Resume command failed");
        Err(failed(detail))
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: &mut Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(pipe) = pipe {
        // A broken pipe only loses output; the exit status still decides.
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).to_string()
}
