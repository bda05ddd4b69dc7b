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

use crate::fleetsync::k8s::pod::PodPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const ANNOTATION_DISPATCHED: &str = "fleetsync.io/dispatched";
pub const ANNOTATION_SCHEDULED: &str = "fleetsync.io/scheduled";
pub const ANNOTATION_RESCHEDULED: &str = "fleetsync.io/rescheduled";
pub const ANNOTATION_PREEMPTED: &str = "fleetsync.io/preempted";
pub const ANNOTATION_STOPPING: &str = "fleetsync.io/stopping";
pub const ANNOTATION_DISPATCH_COUNT: &str = "fleetsync.io/dispatch-count";
/// Label stamped on every cluster object that belongs to a workload.
pub const LABEL_WORKLOAD_ID: &str = "fleetsync.io/workload-id";
/// Node label holding the platform's admin node name.
pub const LABEL_ADMIN_NODE: &str = "fleetsync.io/node-id";

pub const MAX_CONDITIONS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Updating,
    NotReady,
    Succeeded,
    Failed,
    Stopped,
}

impl WorkloadPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadPhase::Pending => "Pending",
            WorkloadPhase::Running => "Running",
            WorkloadPhase::Updating => "Updating",
            WorkloadPhase::NotReady => "NotReady",
            WorkloadPhase::Succeeded => "Succeeded",
            WorkloadPhase::Failed => "Failed",
            WorkloadPhase::Stopped => "Stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkloadPhase::Succeeded | WorkloadPhase::Failed | WorkloadPhase::Stopped
        )
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-like workloads run to completion; applications are kept alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    Job,
    Application,
}

impl WorkloadKind {
    /// Maps a Kubernetes resource kind onto the workload kind.
    pub fn for_resource(resource_kind: &str) -> Self {
        match resource_kind {
            "Deployment" | "StatefulSet" => WorkloadKind::Application,
            _ => WorkloadKind::Job,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    AdminScheduling,
    AdminScheduled,
    AdminDispatched,
    K8sPending,
    K8sSucceeded,
    K8sFailed,
    K8sRunning,
    K8sUpdating,
    K8sDeleted,
    AdminFailover,
    AdminFailed,
    AdminStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: ConditionType,
        message: impl Into<String>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type,
            message: message.into(),
            reason: reason.into(),
            last_transition_time: now,
        }
    }

    fn same_content(&self, other: &Condition) -> bool {
        self.condition_type == other.condition_type
            && self.message == other.message
            && self.reason == other.reason
    }
}

/// Condition reason naming the dispatch round an observation belongs to.
pub fn dispatch_reason(round: u32) -> String {
    format!("Dispatch-{round}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerTermination {
    pub name: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

/// Observed state of one pod belonging to the workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    #[serde(rename = "podId")]
    pub pod_id: String,
    #[serde(rename = "k8sNodeName", default)]
    pub k8s_node_name: String,
    #[serde(rename = "adminNodeName", default)]
    pub admin_node_name: String,
    pub phase: PodPhase,
    #[serde(rename = "hostIP", default)]
    pub host_ip: String,
    #[serde(rename = "podIP", default)]
    pub pod_ip: String,
    #[serde(default)]
    pub rank: String,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(rename = "endTime", default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(rename = "failedMessage", default)]
    pub failed_message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerTermination>,
}

impl PodRecord {
    pub fn new(pod_id: impl Into<String>, phase: PodPhase) -> Self {
        Self {
            pod_id: pod_id.into(),
            k8s_node_name: String::new(),
            admin_node_name: String::new(),
            phase,
            host_ip: String::new(),
            pod_ip: String::new(),
            rank: String::new(),
            start_time: None,
            end_time: None,
            failed_message: String::new(),
            containers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub kind: WorkloadKind,
    /// Kubernetes kind the workload is materialised as in member clusters.
    #[serde(rename = "resourceKind")]
    pub resource_kind: String,
    pub replica: usize,
    #[serde(rename = "maxRetry", default)]
    pub max_retry: u32,
    #[serde(rename = "disableFailover", default)]
    pub disable_failover: bool,
    #[serde(rename = "timeoutSecond", default)]
    pub timeout_second: u64,
    #[serde(rename = "opsJob", default)]
    pub ops_job: bool,
    #[serde(rename = "mainContainer", default)]
    pub main_container: String,
}

impl WorkloadSpec {
    pub fn new(resource_kind: &str, replica: usize) -> Self {
        Self {
            kind: WorkloadKind::for_resource(resource_kind),
            resource_kind: resource_kind.to_string(),
            replica,
            max_retry: 0,
            disable_failover: false,
            timeout_second: 0,
            ops_job: false,
            main_container: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkloadPhase>,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "endTime", default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pods: Vec<PodRecord>,
    /// One entry per dispatch round; index `i` is round `i + 1`.
    #[serde(default)]
    pub nodes: Vec<Vec<String>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl WorkloadStatus {
    /// Appends `condition` honouring the kind's de-duplication rule and the
    /// history bound. Returns whether the history changed.
    pub fn push_condition(&mut self, kind: WorkloadKind, condition: Condition) -> bool {
        let duplicate = match kind {
            WorkloadKind::Application => self
                .conditions
                .last()
                .is_some_and(|last| last.condition_type == condition.condition_type),
            WorkloadKind::Job => self
                .conditions
                .iter()
                .any(|existing| existing.same_content(&condition)),
        };
        if duplicate {
            return false;
        }
        self.conditions.push(condition);
        if self.conditions.len() > MAX_CONDITIONS {
            let excess = self.conditions.len() - MAX_CONDITIONS;
            self.conditions.drain(..excess);
        }
        true
    }

    pub fn pod(&self, pod_id: &str) -> Option<&PodRecord> {
        self.pods.iter().find(|pod| pod.pod_id == pod_id)
    }
}

/// The authoritative cross-cluster record for one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    /// Bumped by the store on every successful write.
    #[serde(rename = "resourceVersion", default)]
    pub resource_version: u64,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(
        rename = "deletionTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl Workload {
    pub fn new(id: impl Into<String>, spec: WorkloadSpec) -> Self {
        Self {
            id: id.into(),
            resource_version: 0,
            annotations: BTreeMap::new(),
            deletion_timestamp: None,
            spec,
            status: WorkloadStatus {
                phase: Some(WorkloadPhase::Pending),
                ..WorkloadStatus::default()
            },
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        self.spec.kind
    }

    pub fn phase(&self) -> Option<WorkloadPhase> {
        self.status.phase
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status.phase, None | Some(WorkloadPhase::Pending))
    }

    pub fn is_running(&self) -> bool {
        self.status.phase == Some(WorkloadPhase::Running)
    }

    /// Terminal phase reached, or the record is being deleted.
    pub fn is_end(&self) -> bool {
        self.deletion_timestamp.is_some()
            || self.status.phase.is_some_and(WorkloadPhase::is_terminal)
    }

    pub fn is_dispatched(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_DISPATCHED)
    }

    pub fn is_preempted(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_PREEMPTED)
    }

    pub fn is_stopping(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_STOPPING)
    }

    /// Current dispatch round; zero before the first placement.
    pub fn dispatch_count(&self) -> u32 {
        self.annotations
            .get(ANNOTATION_DISPATCH_COUNT)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    /// Marks the workload as placed for its next dispatch round, the way the
    /// scheduler does after choosing nodes.
    pub fn mark_dispatched(&mut self) -> u32 {
        let round = self.dispatch_count() + 1;
        self.annotations
            .insert(ANNOTATION_DISPATCH_COUNT.to_string(), round.to_string());
        self.annotations
            .insert(ANNOTATION_DISPATCHED.to_string(), Utc::now().to_rfc3339());
        self.annotations
            .insert(ANNOTATION_SCHEDULED.to_string(), String::new());
        self.annotations.remove(ANNOTATION_RESCHEDULED);
        round
    }
}
