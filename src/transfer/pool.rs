use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::error::{DispatchError, Result};

/// Caps concurrent file transfers per remote host.
///
/// A limiter, not a lock: transfers for different hashes never depend on
/// each other. Requests beyond the cap wait for a permit instead of opening
/// another connection.
#[derive(Debug)]
pub struct TransferPool {
    size: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl TransferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn semaphore(&self, host: &str) -> Arc<Semaphore> {
        self.hosts
            .lock()
            .await
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.size)))
            .clone()
    }

    /// Wait for a transfer slot on `host`. The slot is released when the
    /// permit is dropped.
    pub async fn acquire(&self, host: &str) -> Result<OwnedSemaphorePermit> {
        self.semaphore(host)
            .await
            .acquire_owned()
            .await
            .map_err(|_| {
                DispatchError::Io(std::io::Error::other(format!(
                    "transfer pool for {} closed",
                    host
                )))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_per_host() {
        let pool = TransferPool::new(1);
        let _a = pool.acquire("a").await.unwrap();
        // A full slot on one host does not hold up another.
        let b = tokio::time::timeout(std::time::Duration::from_millis(100), pool.acquire("b")).await;
        assert!(matches!(b, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn excess_requests_wait() {
        let pool = Arc::new(TransferPool::new(1));
        let first = pool.acquire("a").await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("a").await.map(|_| ()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap().unwrap();
    }

    #[test]
    fn zero_size_is_raised_to_one() {
        assert_eq!(TransferPool::new(0).size, 1);
    }
}
