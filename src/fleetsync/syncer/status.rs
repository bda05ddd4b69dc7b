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

//! Derives the observed status of a job-like resource from the object a
//! member cluster returns.

use super::error::SyncError;
use super::message::JobLikeKind;
use crate::fleetsync::k8s::deployment::Deployment;
use crate::fleetsync::k8s::from_object;
use crate::fleetsync::k8s::job::{Job, JobCondition};
use crate::fleetsync::k8s::statefulset::StatefulSet;
use crate::fleetsync::workload::types::ConditionType;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub const REASON_RESOURCE_DELETED: &str = "ResourceDeleted";

const JOB_SUCCEEDED_MESSAGE: &str = "Job is successfully completed";
const JOB_FAILED_MESSAGE: &str = "Job is failed";
const JOB_RUNNING_MESSAGE: &str = "the job is running";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Deleted,
    Updating,
}

impl ObservedPhase {
    pub fn condition_type(self) -> ConditionType {
        match self {
            ObservedPhase::Pending => ConditionType::K8sPending,
            ObservedPhase::Running => ConditionType::K8sRunning,
            ObservedPhase::Succeeded => ConditionType::K8sSucceeded,
            ObservedPhase::Failed => ConditionType::K8sFailed,
            ObservedPhase::Deleted => ConditionType::K8sDeleted,
            ObservedPhase::Updating => ConditionType::K8sUpdating,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ObservedPhase::Failed | ObservedPhase::Deleted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedStatus {
    pub phase: ObservedPhase,
    pub message: String,
    pub reason: String,
}

impl ObservedStatus {
    pub fn new(phase: ObservedPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            reason: String::new(),
        }
    }

    /// Status synthesised for a delete-action message; no lookup is made.
    pub fn deleted(kind: &str, name: &str) -> Self {
        Self {
            phase: ObservedPhase::Deleted,
            message: format!("{kind} {name} is deleted"),
            reason: REASON_RESOURCE_DELETED.to_string(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.phase == ObservedPhase::Pending
    }
}

/// Converts `object` into an observed status for `kind`.
///
/// A job-like object that cannot be decoded will never decode on retry and
/// is reported as [`SyncError::Unrecoverable`].
pub fn observe(kind: JobLikeKind, object: Value) -> Result<ObservedStatus, SyncError> {
    match kind {
        JobLikeKind::Job => decode::<Job>(kind, object).map(|job| observe_job(&job)),
        JobLikeKind::Deployment => {
            decode::<Deployment>(kind, object).map(|deployment| observe_deployment(&deployment))
        }
        JobLikeKind::StatefulSet => {
            decode::<StatefulSet>(kind, object).map(|sts| observe_statefulset(&sts))
        }
    }
}

fn decode<T: DeserializeOwned>(kind: JobLikeKind, object: Value) -> Result<T, SyncError> {
    from_object(object).map_err(|err| {
        SyncError::unrecoverable(format!("failed to parse {} object: {err}", kind.as_str()))
    })
}

pub fn observe_job(job: &Job) -> ObservedStatus {
    let Some(status) = job.status.as_ref() else {
        return ObservedStatus::new(ObservedPhase::Pending, "");
    };
    if let Some(condition) = status.true_condition("Complete") {
        return condition_status(ObservedPhase::Succeeded, condition, JOB_SUCCEEDED_MESSAGE);
    }
    if let Some(condition) = status.true_condition("Failed") {
        return condition_status(ObservedPhase::Failed, condition, JOB_FAILED_MESSAGE);
    }
    if status.active.unwrap_or(0) > 0 {
        return ObservedStatus::new(ObservedPhase::Running, JOB_RUNNING_MESSAGE);
    }
    ObservedStatus::new(ObservedPhase::Pending, "")
}

fn condition_status(
    phase: ObservedPhase,
    condition: &JobCondition,
    fallback: &str,
) -> ObservedStatus {
    let message = condition
        .message
        .as_deref()
        .filter(|message| !message.is_empty())
        .unwrap_or(fallback);
    ObservedStatus {
        phase,
        message: message.to_string(),
        reason: condition.reason.clone().unwrap_or_default(),
    }
}

pub fn observe_deployment(deployment: &Deployment) -> ObservedStatus {
    let desired = deployment.desired_replicas();
    let status = deployment.status.clone().unwrap_or_default();
    let generation = deployment.metadata.generation.unwrap_or(0);
    let rolled_out = status.observed_generation.unwrap_or(0) >= generation
        && status.updated_replicas.unwrap_or(0) >= desired;
    if !rolled_out {
        return ObservedStatus::new(ObservedPhase::Updating, "the deployment is updating");
    }
    if status.ready_replicas.unwrap_or(0) == desired {
        ObservedStatus::new(ObservedPhase::Running, "the deployment is ready")
    } else {
        ObservedStatus::new(ObservedPhase::Failed, "the deployment is not ready")
    }
}

pub fn observe_statefulset(statefulset: &StatefulSet) -> ObservedStatus {
    let desired = statefulset.desired_replicas();
    let status = statefulset.status.clone().unwrap_or_default();
    if status.current_revision != status.update_revision {
        return ObservedStatus::new(ObservedPhase::Updating, "the statefulSet is updating");
    }
    if status.ready_replicas.unwrap_or(0) == desired {
        ObservedStatus::new(ObservedPhase::Running, "the statefulSet is ready")
    } else {
        ObservedStatus::new(ObservedPhase::Failed, "the statefulSet is not ready")
    }
}
