use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use herald_core::PolicySet;
use tracing::info;

use super::{JobBinding, JobDescriptor, JobStatus};
use crate::RegistryError;

/// Running/Aborted per job name.
///
/// The only mutable state attached to a registry. Updates lock only the
/// shard holding the job name, so Register/Abort/fire handling for different
/// jobs never contend.
#[derive(Debug, Default)]
pub struct JobStatusTable {
    statuses: DashMap<String, JobStatus>,
}

impl JobStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_name: &str) -> Option<JobStatus> {
        self.statuses.get(job_name).map(|s| *s)
    }

    /// Set the status of a known job. Returns the previous status, or `None`
    /// when the job is not in the table.
    pub fn set(&self, job_name: &str, status: JobStatus) -> Option<JobStatus> {
        self.statuses
            .get_mut(job_name)
            .map(|mut entry| std::mem::replace(entry.value_mut(), status))
    }

    pub fn snapshot(&self) -> HashMap<String, JobStatus> {
        self.statuses
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    fn insert(&self, job_name: String) {
        self.statuses.insert(job_name, JobStatus::Running);
    }
}

/// Jobs declared by one scheduler, keyed by name.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<JobDescriptor>>,
    order: Vec<String>,
    statuses: JobStatusTable,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::default()
    }

    pub fn get(&self, job_name: &str) -> Option<Arc<JobDescriptor>> {
        self.jobs.get(job_name).cloned()
    }

    pub fn is_registered(&self, job_name: &str) -> bool {
        self.jobs.contains_key(job_name)
    }

    /// Jobs in declaration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<JobDescriptor>> {
        self.order.iter().filter_map(|name| self.jobs.get(name))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn statuses(&self) -> &JobStatusTable {
        &self.statuses
    }
}

#[derive(Default)]
pub struct JobRegistryBuilder {
    bindings: Vec<JobBinding>,
    policies: PolicySet,
}

impl JobRegistryBuilder {
    pub fn job(mut self, binding: JobBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }

    /// Validate every declaration and seed the status table with `Running`.
    pub fn build(self) -> Result<Arc<JobRegistry>, RegistryError> {
        let mut registry = JobRegistry::default();

        for binding in self.bindings {
            if registry.jobs.contains_key(&binding.name) {
                return Err(RegistryError::DuplicateJob(binding.name));
            }

            binding
                .schedule
                .validate()
                .map_err(|reason| RegistryError::InvalidSchedule {
                    job: binding.name.clone(),
                    reason,
                })?;

            let auth = binding
                .auth
                .resolve(&self.policies)
                .map_err(|unknown| RegistryError::UnknownPolicy {
                    handler: binding.name.clone(),
                    policy: unknown.0,
                })?;

            let descriptor = JobDescriptor {
                name: binding.name.clone(),
                schedule: binding.schedule,
                auth,
                handler_type: binding.handler_type,
                factory: binding.factory,
            };

            registry.statuses.insert(binding.name.clone());
            registry.order.push(binding.name.clone());
            registry.jobs.insert(binding.name, Arc::new(descriptor));
        }

        info!("Registered {} job(s)", registry.jobs.len());
        Ok(Arc::new(registry))
    }
}
