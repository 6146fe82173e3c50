use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::fleet::{Fleet, Job, Vitals};

/// Picks the next job for an idle worker.
#[async_trait]
pub trait CandidateSelector: Send + Sync {
    async fn find_candidate(&self, vitals: &Vitals) -> Result<Option<Job>>;
}

/// Takes the best-scored waiting job the worker can build. Scores are
/// computed elsewhere; this only orders by them.
pub struct QueueSelector {
    fleet: Arc<RwLock<Fleet>>,
}

impl QueueSelector {
    pub fn new(fleet: Arc<RwLock<Fleet>>) -> Self {
        Self { fleet }
    }
}

#[async_trait]
impl CandidateSelector for QueueSelector {
    async fn find_candidate(&self, vitals: &Vitals) -> Result<Option<Job>> {
        let fleet = self.fleet.read().await;
        Ok(fleet.candidates(vitals).first().map(|j| (*j).clone()))
    }
}
