use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus, JobTransition, TransitionError};

/// Filter for [`JobStore::list_by`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Match any of these statuses. Empty matches every status.
    pub statuses: Vec<JobStatus>,
    /// Only jobs whose `completed_at` is strictly older than this instant.
    pub completed_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl JobFilter {
    /// Terminal jobs that finished before `cutoff`, i.e. retention candidates.
    pub fn expired(cutoff: DateTime<Utc>) -> Self {
        Self {
            statuses: vec![JobStatus::Completed, JobStatus::Failed],
            completed_before: Some(cutoff),
            limit: None,
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        match self.completed_before {
            Some(cutoff) => job.completed_at.is_some_and(|at| at < cutoff),
            None => true,
        }
    }
}

/// Durable record of every job. Writes are atomic per job.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<Uuid, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Apply one state-machine step atomically and return the updated job.
    async fn update(&self, id: Uuid, transition: JobTransition) -> Result<Job, StoreError>;

    async fn list_by(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job record: {0}")]
    Corrupt(String),
}

/// In-process job store for tests and single-process development.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Overwrite a record wholesale. Used to seed fixtures such as aged jobs.
    pub async fn put(&self, job: Job) {
        self.jobs.write().await.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<Uuid, StoreError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(job.id)
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: Uuid, transition: JobTransition) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        // Apply to a copy so a rejected transition leaves the record untouched.
        let mut next = job.clone();
        next.apply(transition)?;
        *job = next.clone();
        Ok(next)
    }

    async fn list_by(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matched.sort_by_key(|j| j.created_at);
        if let Some(limit) = filter.limit {
            matched.truncate(limit.max(0) as usize);
        }
        Ok(matched)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.jobs
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
