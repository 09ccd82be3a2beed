use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use herald_bus::{JobSchedule, JobStatus};
use serde::{Deserialize, Serialize};

use crate::SchedulerResult;

/// How the last fire of a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FireOutcome {
    Acknowledged,
    NotFound,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub subscriber_id: String,
    pub job_name: String,
    pub schedule: JobSchedule,
    pub status: JobStatus,
    pub registered_at: DateTime<Utc>,
    pub last_outcome: Option<FireOutcome>,
    pub last_outcome_at: Option<DateTime<Utc>>,
}

/// Durable record of every job of every subscriber, keyed by
/// `(subscriber id, job name)`.
#[async_trait]
pub trait JobCatalog: Send + Sync {
    /// Insert or replace the registration. Replacing keeps the last outcome.
    async fn upsert(
        &self,
        subscriber_id: &str,
        job_name: &str,
        schedule: JobSchedule,
        status: JobStatus,
    ) -> SchedulerResult<CatalogEntry>;

    /// Returns the previous status, `None` for an unknown job.
    async fn set_status(
        &self,
        subscriber_id: &str,
        job_name: &str,
        status: JobStatus,
    ) -> SchedulerResult<Option<JobStatus>>;

    async fn record_outcome(
        &self,
        subscriber_id: &str,
        job_name: &str,
        outcome: FireOutcome,
    ) -> SchedulerResult<()>;

    async fn get(&self, subscriber_id: &str, job_name: &str)
        -> SchedulerResult<Option<CatalogEntry>>;

    async fn list(&self) -> SchedulerResult<Vec<CatalogEntry>>;

    /// Distinct subscriber ids, sorted.
    async fn subscribers(&self) -> SchedulerResult<Vec<String>>;
}

type CatalogKey = (String, String);

fn key(subscriber_id: &str, job_name: &str) -> CatalogKey {
    (subscriber_id.to_string(), job_name.to_string())
}

/// Per-key locking through `DashMap` shards, so Register/Abort/replies for
/// different jobs never wait on each other.
#[derive(Debug, Default)]
pub struct MemoryJobCatalog {
    entries: DashMap<CatalogKey, CatalogEntry>,
}

impl MemoryJobCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl JobCatalog for MemoryJobCatalog {
    async fn upsert(
        &self,
        subscriber_id: &str,
        job_name: &str,
        schedule: JobSchedule,
        status: JobStatus,
    ) -> SchedulerResult<CatalogEntry> {
        let now = Utc::now();
        let mut entry = self
            .entries
            .entry(key(subscriber_id, job_name))
            .or_insert_with(|| CatalogEntry {
                subscriber_id: subscriber_id.to_string(),
                job_name: job_name.to_string(),
                schedule: schedule.clone(),
                status,
                registered_at: now,
                last_outcome: None,
                last_outcome_at: None,
            });

        entry.schedule = schedule;
        entry.status = status;
        entry.registered_at = now;
        Ok(entry.clone())
    }

    async fn set_status(
        &self,
        subscriber_id: &str,
        job_name: &str,
        status: JobStatus,
    ) -> SchedulerResult<Option<JobStatus>> {
        Ok(self
            .entries
            .get_mut(&key(subscriber_id, job_name))
            .map(|mut entry| std::mem::replace(&mut entry.status, status)))
    }

    async fn record_outcome(
        &self,
        subscriber_id: &str,
        job_name: &str,
        outcome: FireOutcome,
    ) -> SchedulerResult<()> {
        if let Some(mut entry) = self.entries.get_mut(&key(subscriber_id, job_name)) {
            entry.last_outcome = Some(outcome);
            entry.last_outcome_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get(
        &self,
        subscriber_id: &str,
        job_name: &str,
    ) -> SchedulerResult<Option<CatalogEntry>> {
        Ok(self
            .entries
            .get(&key(subscriber_id, job_name))
            .map(|entry| entry.clone()))
    }

    async fn list(&self) -> SchedulerResult<Vec<CatalogEntry>> {
        let mut entries: Vec<CatalogEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| {
            (a.subscriber_id.as_str(), a.job_name.as_str())
                .cmp(&(b.subscriber_id.as_str(), b.job_name.as_str()))
        });
        Ok(entries)
    }

    async fn subscribers(&self) -> SchedulerResult<Vec<String>> {
        let mut subscribers: Vec<String> = self.entries.iter().map(|e| e.key().0.clone()).collect();
        subscribers.sort();
        subscribers.dedup();
        Ok(subscribers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reregistration_replaces_schedule_and_resets_status() {
        let catalog = MemoryJobCatalog::new();
        catalog
            .upsert("svc", "SendDigest", JobSchedule::daily(), JobStatus::Running)
            .await
            .unwrap();
        catalog
            .set_status("svc", "SendDigest", JobStatus::Aborted)
            .await
            .unwrap();
        catalog
            .record_outcome("svc", "SendDigest", FireOutcome::Acknowledged)
            .await
            .unwrap();

        let entry = catalog
            .upsert("svc", "SendDigest", JobSchedule::hourly(), JobStatus::Running)
            .await
            .unwrap();

        assert_eq!(entry.status, JobStatus::Running);
        assert_eq!(entry.schedule, JobSchedule::hourly());
        assert_eq!(entry.last_outcome, Some(FireOutcome::Acknowledged));
        assert_eq!(catalog.len(), 1);
    }

    #[tokio::test]
    async fn unknown_jobs_are_left_alone() {
        let catalog = MemoryJobCatalog::new();

        assert_eq!(
            catalog.set_status("svc", "Ghost", JobStatus::Aborted).await.unwrap(),
            None
        );
        catalog
            .record_outcome("svc", "Ghost", FireOutcome::NotFound)
            .await
            .unwrap();
        assert!(catalog.get("svc", "Ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_is_sorted_and_subscribers_are_distinct() {
        let catalog = MemoryJobCatalog::new();
        for (svc, job) in [("b-svc", "Two"), ("a-svc", "One"), ("b-svc", "One")] {
            catalog
                .upsert(svc, job, JobSchedule::daily(), JobStatus::Running)
                .await
                .unwrap();
        }

        let names: Vec<(String, String)> = catalog
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.subscriber_id, e.job_name))
            .collect();
        assert_eq!(names[0], ("a-svc".to_string(), "One".to_string()));
        assert_eq!(names[2], ("b-svc".to_string(), "Two".to_string()));
        assert_eq!(catalog.subscribers().await.unwrap(), vec!["a-svc", "b-svc"]);
    }
}
