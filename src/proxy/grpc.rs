use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::fleet::Vitals;
use crate::lifecycle::HostController;
use crate::proto::worker_agent_client::WorkerAgentClient;
use crate::proto::{
    self, AbortRequest, CleanRequest, EchoRequest, EnsurePresentRequest, FetchFileRequest,
    InfoRequest, StatusRequest,
};
use crate::proxy::{
    BuildPayload, BuildStarted, BuilderStatus, Credentials, EnsurePresent, RemoteStatus,
    WorkerInfo, WorkerProxy,
};

/// [`WorkerProxy`] over the agent's gRPC service.
///
/// The channel connects lazily; the connection timeout bounds establishing
/// it and the call timeout bounds each round trip, so a call against an
/// unreachable worker is bounded by whichever fires first.
pub struct GrpcWorkerProxy {
    target: Vitals,
    client: WorkerAgentClient<Channel>,
    call_timeout: Duration,
    ensure_present_timeout: Duration,
    host: Arc<HostController>,
}

impl GrpcWorkerProxy {
    pub fn new(target: Vitals, config: &DispatchConfig, host: Arc<HostController>) -> Result<Self> {
        let channel = Endpoint::from_shared(target.url.clone())?
            .connect_timeout(config.connection_timeout)
            .connect_lazy();

        Ok(Self {
            target,
            client: WorkerAgentClient::new(channel),
            call_timeout: config.call_timeout,
            ensure_present_timeout: config.ensure_present_timeout(),
            host,
        })
    }

    /// Await one RPC, cancelling it if it outlives `limit`.
    async fn call<T>(
        &self,
        operation: &'static str,
        limit: Duration,
        request: impl Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    ) -> Result<T> {
        match timeout(limit, request).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => {
                tracing::debug!(worker = %self.target.name, operation, code = ?status.code(), "Call failed");
                Err(remote_error(operation, status))
            }
            Err(_) => {
                tracing::warn!(worker = %self.target.name, operation, timeout = ?limit, "Call timed out, cancelled");
                Err(DispatchError::Cancelled {
                    operation,
                    after: limit,
                })
            }
        }
    }
}

/// Refusals from the agent are protocol faults; anything else is transport.
fn remote_error(operation: &'static str, status: tonic::Status) -> DispatchError {
    match status.code() {
        Code::FailedPrecondition | Code::Internal | Code::InvalidArgument => {
            DispatchError::RemoteFault {
                operation,
                message: status.message().to_string(),
            }
        }
        _ => DispatchError::GrpcError(status),
    }
}

fn builder_status(raw: proto::BuilderStatus, operation: &str) -> Result<BuilderStatus> {
    match raw {
        proto::BuilderStatus::Idle => Ok(BuilderStatus::Idle),
        proto::BuilderStatus::Building => Ok(BuilderStatus::Building),
        proto::BuilderStatus::Waiting => Ok(BuilderStatus::Waiting),
        proto::BuilderStatus::Aborting => Ok(BuilderStatus::Aborting),
        proto::BuilderStatus::Unspecified => Err(DispatchError::ProtocolViolation(format!(
            "{} reply has no builder_status",
            operation
        ))),
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[async_trait]
impl WorkerProxy for GrpcWorkerProxy {
    fn name(&self) -> &str {
        &self.target.name
    }

    async fn echo(&self, args: Vec<String>) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let resp = self
            .call("echo", self.call_timeout, client.echo(EchoRequest { args }))
            .await?;
        Ok(resp.args)
    }

    async fn info(&self) -> Result<WorkerInfo> {
        let mut client = self.client.clone();
        let resp = self
            .call("info", self.call_timeout, client.info(InfoRequest {}))
            .await?;
        Ok(WorkerInfo {
            protocol_version: resp.protocol_version,
            arch_tag: resp.arch_tag,
            build_types: resp.build_types,
        })
    }

    async fn status(&self) -> Result<RemoteStatus> {
        let mut client = self.client.clone();
        let resp = self
            .call("status", self.call_timeout, client.status(StatusRequest {}))
            .await?;
        let builder_status = builder_status(resp.builder_status(), "status")?;
        Ok(RemoteStatus {
            builder_status,
            build_id: non_empty(resp.build_id),
            build_status: non_empty(resp.build_status),
            logtail: if resp.logtail.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(&resp.logtail).to_string())
            },
            filemap: resp.filemap.into_iter().collect(),
            dependencies: non_empty(resp.dependencies),
        })
    }

    async fn abort(&self) -> Result<()> {
        let mut client = self.client.clone();
        self.call("abort", self.call_timeout, client.abort(AbortRequest {}))
            .await?;
        Ok(())
    }

    async fn clean(&self) -> Result<()> {
        let mut client = self.client.clone();
        self.call("clean", self.call_timeout, client.clean(CleanRequest {}))
            .await?;
        Ok(())
    }

    async fn ensure_present(
        &self,
        sha1: &str,
        url: Option<&str>,
        credentials: Option<&Credentials>,
    ) -> Result<EnsurePresent> {
        let mut client = self.client.clone();
        let request = EnsurePresentRequest {
            sha1: sha1.to_string(),
            url: url.unwrap_or_default().to_string(),
            username: credentials.map(|c| c.username.clone()).unwrap_or_default(),
            password: credentials.map(|c| c.password.clone()).unwrap_or_default(),
        };
        let resp = self
            .call(
                "ensure_present",
                self.ensure_present_timeout,
                client.ensure_present(request),
            )
            .await?;
        Ok(EnsurePresent {
            present: resp.present,
            outcome: resp.outcome,
        })
    }

    /// Each chunk must arrive within one call timeout; large files are not
    /// bounded as a whole.
    async fn fetch_file(
        &self,
        sha1: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let mut client = self.client.clone();
        let request = FetchFileRequest {
            sha1: sha1.to_string(),
        };
        let mut stream = self
            .call("fetch_file", self.call_timeout, client.fetch_file(request))
            .await?;

        let mut written = 0u64;
        loop {
            match timeout(self.call_timeout, stream.message()).await {
                Ok(Ok(Some(chunk))) => {
                    sink.write_all(&chunk.data).await?;
                    written += chunk.data.len() as u64;
                }
                Ok(Ok(None)) => break,
                Ok(Err(status)) => return Err(remote_error("fetch_file", status)),
                Err(_) => {
                    return Err(DispatchError::Cancelled {
                        operation: "fetch_file",
                        after: self.call_timeout,
                    })
                }
            }
        }
        sink.flush().await?;
        Ok(written)
    }

    async fn build(
        &self,
        build_id: &str,
        cookie: &str,
        payload: &BuildPayload,
    ) -> Result<BuildStarted> {
        let mut client = self.client.clone();
        let request = proto::BuildRequest {
            build_id: build_id.to_string(),
            build_type: payload.build_type.clone(),
            chroot_sha1: payload.chroot_sha1.clone(),
            cookie: cookie.to_string(),
            filemap: payload.filemap.clone().into_iter().collect(),
            args: payload.args.clone().into_iter().collect(),
        };
        let resp = self
            .call("build", self.call_timeout, client.build(request))
            .await?;
        Ok(BuildStarted {
            builder_status: builder_status(resp.builder_status(), "build")?,
            build_id: resp.build_id,
        })
    }

    async fn resume(&self) -> Result<(String, String)> {
        self.host.resume_host(&self.target).await
    }
}
