use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;

use crate::error::{DispatchError, Result};
use crate::fleet::InputFile;
use crate::proxy::{Credentials, WorkerProxy};
use crate::transfer::TransferPool;

/// Moves build inputs onto workers and files off them.
#[derive(Debug, Clone)]
pub struct FileStager {
    pool: Arc<TransferPool>,
}

impl FileStager {
    pub fn new(pool: Arc<TransferPool>) -> Self {
        Self { pool }
    }

    /// Make sure the worker holds every input, letting it download missing
    /// ones from the content store.
    ///
    /// Inputs sharing a hash are requested once.
    pub async fn stage_inputs(
        &self,
        proxy: Arc<dyn WorkerProxy>,
        host: &str,
        files: &[InputFile],
        credentials: Option<Credentials>,
    ) -> Result<()> {
        let mut wanted: BTreeMap<String, Option<String>> = BTreeMap::new();
        for file in files {
            let url = wanted.entry(file.sha1.clone()).or_default();
            if url.is_none() {
                *url = file.url.clone();
            }
        }

        let mut tasks = JoinSet::new();
        for (sha1, url) in wanted {
            let proxy = proxy.clone();
            let pool = self.pool.clone();
            let host = host.to_string();
            let credentials = credentials.clone();
            tasks.spawn(async move {
                let _permit = pool.acquire(&host).await?;
                let reply = proxy
                    .ensure_present(&sha1, url.as_deref(), credentials.as_ref())
                    .await?;
                if !reply.present {
                    return Err(DispatchError::ContentUnavailable {
                        sha1,
                        reason: reply.outcome,
                    });
                }
                tracing::debug!(worker = %proxy.name(), sha1 = %sha1, outcome = %reply.outcome, "Input present");
                Ok(())
            });
        }

        first_error(tasks).await
    }

    /// Fetch files from the worker to local paths.
    ///
    /// Each distinct hash is downloaded once; further paths for the same hash
    /// are copied from the first. Files land atomically: a failed transfer
    /// leaves nothing behind at the destination.
    pub async fn get_files(
        &self,
        proxy: Arc<dyn WorkerProxy>,
        host: &str,
        files: Vec<(String, PathBuf)>,
    ) -> Result<()> {
        let mut by_hash: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for (sha1, path) in files {
            by_hash.entry(sha1).or_default().push(path);
        }

        let mut tasks = JoinSet::new();
        for (sha1, paths) in by_hash {
            let proxy = proxy.clone();
            let pool = self.pool.clone();
            let host = host.to_string();
            tasks.spawn(async move {
                let Some((first, rest)) = paths.split_first() else {
                    return Ok(());
                };
                {
                    let _permit = pool.acquire(&host).await?;
                    download(proxy.as_ref(), &sha1, first)
                        .await
                        .map_err(|e| unavailable(&sha1, e))?;
                }
                for path in rest {
                    land_copy(first, path)
                        .await
                        .map_err(|e| unavailable(&sha1, e))?;
                }
                Ok(())
            });
        }

        first_error(tasks).await
    }
}

/// Wait for every task so none is left writing, then report the first error.
async fn first_error(mut tasks: JoinSet<Result<()>>) -> Result<()> {
    let mut first = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|e| {
            Err(DispatchError::Io(std::io::Error::other(e.to_string())))
        });
        if let Err(e) = outcome {
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn unavailable(sha1: &str, error: DispatchError) -> DispatchError {
    match error {
        DispatchError::ContentUnavailable { .. } => error,
        other => DispatchError::ContentUnavailable {
            sha1: sha1.to_string(),
            reason: other.to_string(),
        },
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

async fn download(proxy: &dyn WorkerProxy, sha1: &str, dest: &Path) -> Result<()> {
    let part = partial_path(dest);
    let mut file = fs::File::create(&part).await?;
    let fetched = proxy.fetch_file(sha1, &mut file).await;
    let synced = match fetched {
        Ok(bytes) => file.flush().await.map(|_| bytes).map_err(DispatchError::from),
        Err(e) => Err(e),
    };
    drop(file);
    match synced {
        Ok(bytes) => {
            if let Err(e) = fs::rename(&part, dest).await {
                let _ = fs::remove_file(&part).await;
                return Err(e.into());
            }
            tracing::debug!(sha1, dest = %dest.display(), bytes, "File fetched");
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&part).await;
            Err(e)
        }
    }
}

async fn land_copy(source: &Path, dest: &Path) -> Result<()> {
    let part = partial_path(dest);
    let landed = match fs::copy(source, &part).await {
        Ok(_) => fs::rename(&part, dest).await,
        Err(e) => Err(e),
    };
    if let Err(e) = landed {
        let _ = fs::remove_file(&part).await;
        return Err(e.into());
    }
    Ok(())
}
