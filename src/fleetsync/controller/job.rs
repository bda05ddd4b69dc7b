/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Bounded-lifetime jobs that follow one Logical Workload, driven through
//! the staged reconcile skeleton.

use crate::fleetsync::controller::reconcile::{
    Completion, CompletionPhase, ReconcileContext, ReconcileOutcome, StagedObject,
    StagedReconciler, REASON_JOB_FAILED,
};
use crate::fleetsync::controller::store::ObjectStore;
use crate::fleetsync::logger::log_warn;
use crate::fleetsync::syncer::error::{SyncError, SyncFuture};
use crate::fleetsync::workload::{Workload, WorkloadPhase, WorkloadStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const JOB_FINALIZER: &str = "fleetsync.io/job-finalizer";
pub const LABEL_CONTROLLER: &str = "fleetsync.io/controller";
pub const CONDITION_JOB_COMPLETED: &str = "JobCompleted";

const COMPONENT: &str = "workload-job-controller";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagedJobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedJobCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub reason: String,
    pub message: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedJobSpec {
    #[serde(rename = "workloadId")]
    pub workload_id: String,
    #[serde(rename = "timeoutSecond", default)]
    pub timeout_second: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedJobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ManagedJobPhase>,
    #[serde(rename = "startedAt", default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt", default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub conditions: Vec<ManagedJobCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedJob {
    pub name: String,
    #[serde(rename = "resourceVersion", default)]
    pub resource_version: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(rename = "creationTimestamp")]
    pub creation_timestamp: DateTime<Utc>,
    #[serde(rename = "deletionTimestamp", default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub spec: ManagedJobSpec,
    #[serde(default)]
    pub status: ManagedJobStatus,
}

impl ManagedJob {
    pub fn new(name: &str, workload_id: &str, controller: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CONTROLLER.to_string(), controller.to_string());
        Self {
            name: name.to_string(),
            resource_version: 0,
            labels,
            finalizers: vec![JOB_FINALIZER.to_string()],
            creation_timestamp: Utc::now(),
            deletion_timestamp: None,
            spec: ManagedJobSpec {
                workload_id: workload_id.to_string(),
                timeout_second: 0,
            },
            status: ManagedJobStatus::default(),
        }
    }

    pub fn with_timeout(mut self, timeout_second: u64) -> Self {
        self.spec.timeout_second = timeout_second;
        self
    }

    pub fn phase(&self) -> Option<ManagedJobPhase> {
        self.status.phase
    }
}

impl StagedObject for ManagedJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn resource_version(&self) -> u64 {
        self.resource_version
    }

    fn set_resource_version(&mut self, version: u64) {
        self.resource_version = version;
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.status.phase,
            Some(ManagedJobPhase::Succeeded | ManagedJobPhase::Failed)
        )
    }

    fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == JOB_FINALIZER)
    }

    fn remove_finalizer(&mut self) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != JOB_FINALIZER);
        before != self.finalizers.len()
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        Some(self.creation_timestamp)
    }

    fn timeout_second(&self) -> u64 {
        self.spec.timeout_second
    }

    fn complete(&mut self, completion: &Completion, now: DateTime<Utc>) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status.phase = Some(match completion.phase {
            CompletionPhase::Succeeded => ManagedJobPhase::Succeeded,
            CompletionPhase::Failed => ManagedJobPhase::Failed,
        });
        self.status.finished_at = Some(now);
        self.status.started_at.get_or_insert(now);
        self.status.message = completion.message.clone();
        self.status.conditions.push(ManagedJobCondition {
            condition_type: CONDITION_JOB_COMPLETED.to_string(),
            reason: completion.reason.clone(),
            message: completion.message.clone(),
            last_transition_time: now,
        });
        true
    }
}

/// Mirrors the phase of the bound workload onto a [`ManagedJob`].
pub struct WorkloadJobController {
    instance: String,
    workloads: Arc<dyn WorkloadStore>,
    jobs: Arc<dyn ObjectStore<ManagedJob>>,
}

impl WorkloadJobController {
    pub fn new(
        instance: impl Into<String>,
        workloads: Arc<dyn WorkloadStore>,
        jobs: Arc<dyn ObjectStore<ManagedJob>>,
    ) -> Self {
        Self {
            instance: instance.into(),
            workloads,
            jobs,
        }
    }

    async fn mirror(
        &self,
        ctx: &ReconcileContext,
        job: &ManagedJob,
    ) -> Result<ReconcileOutcome, SyncError> {
        let workload = match self.workloads.get(&job.spec.workload_id).await {
            Ok(workload) => workload,
            Err(err) if err.is_not_found() => {
                return Err(SyncError::non_retryable(format!(
                    "workload {} not found",
                    job.spec.workload_id
                )))
            }
            Err(err) => return Err(err),
        };

        let mut updated = job.clone();
        let now = Utc::now();
        if workload.is_end() {
            let message = completion_message(&workload);
            let completion = if workload.phase() == Some(WorkloadPhase::Succeeded) {
                Completion::succeeded(message)
            } else {
                Completion::failed(REASON_JOB_FAILED, message)
            };
            if updated.complete(&completion, now) {
                self.jobs.update(&updated).await?;
            }
            return Ok(ReconcileOutcome::done());
        }

        if workload.is_pending() {
            if updated.status.phase.is_none() {
                updated.status.phase = Some(ManagedJobPhase::Pending);
                self.jobs.update(&updated).await?;
            }
            let delay = match updated.deadline_remaining(now) {
                Some(left) => left.min(ctx.config().not_ready_requeue),
                None => ctx.config().not_ready_requeue,
            };
            return Ok(ReconcileOutcome::requeue_after(delay));
        }

        if updated.status.phase != Some(ManagedJobPhase::Running) {
            updated.status.phase = Some(ManagedJobPhase::Running);
            updated.status.started_at.get_or_insert(now);
            self.jobs.update(&updated).await?;
        }
        // A running workload produces no further passes of its own; come
        // back when the deadline is due.
        Ok(match updated.deadline_remaining(now) {
            Some(left) => ReconcileOutcome::requeue_after(left),
            None => ReconcileOutcome::done(),
        })
    }
}

/// Most specific user-facing text available on an ended workload.
fn completion_message(workload: &Workload) -> String {
    let from_condition = workload
        .status
        .conditions
        .last()
        .map(|condition| condition.message.as_str())
        .filter(|message| !message.is_empty());
    let from_status = Some(workload.status.message.as_str()).filter(|m| !m.is_empty());
    match from_condition.or(from_status) {
        Some(message) => message.to_string(),
        None => format!(
            "workload {} is {}",
            workload.id,
            workload
                .phase()
                .map(WorkloadPhase::as_str)
                .unwrap_or("ended")
        ),
    }
}

impl StagedReconciler for WorkloadJobController {
    type Object = ManagedJob;

    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn filter(&self, job: &ManagedJob) -> bool {
        job.labels.get(LABEL_CONTROLLER) != Some(&self.instance)
    }

    fn observe<'a>(
        &'a self,
        _ctx: &'a ReconcileContext,
        job: &'a ManagedJob,
    ) -> SyncFuture<'a, bool> {
        let finished = job.is_finished();
        Box::pin(async move { Ok(finished) })
    }

    fn timeout<'a>(
        &'a self,
        _ctx: &'a ReconcileContext,
        job: &'a ManagedJob,
    ) -> SyncFuture<'a, ()> {
        Box::pin(async move {
            let timeout = job.spec.timeout_second.to_string();
            log_warn(
                COMPONENT,
                "Job deadline exceeded",
                &[
                    ("job", job.name.as_str()),
                    ("workload", job.spec.workload_id.as_str()),
                    ("timeoutSecond", timeout.as_str()),
                ],
            );
            Ok(())
        })
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a ReconcileContext,
        job: &'a ManagedJob,
    ) -> SyncFuture<'a, ReconcileOutcome> {
        Box::pin(self.mirror(ctx, job))
    }
}
