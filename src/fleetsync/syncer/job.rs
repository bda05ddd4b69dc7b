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

//! Folds the observed status of a job-like resource (Job, Deployment,
//! StatefulSet) into its Logical Workload: phase, node history,
//! conditions and the re-schedule path.

use super::cluster::ClusterGateway;
use super::error::SyncError;
use super::message::{ChangeMessage, JobLikeKind};
use super::status::{self, ObservedPhase, ObservedStatus};
use crate::fleetsync::controller::reconcile::{ReconcileContext, ReconcileOutcome};
use crate::fleetsync::k8s::pod::PodPhase;
use crate::fleetsync::k8s::statefulset::LabelSelector;
use crate::fleetsync::logger::{log_debug, log_info};
use crate::fleetsync::observability::metrics;
use crate::fleetsync::workload::types::{
    dispatch_reason, Condition, ConditionType, Workload, WorkloadKind, WorkloadPhase,
    ANNOTATION_DISPATCHED, ANNOTATION_RESCHEDULED, ANNOTATION_SCHEDULED, LABEL_WORKLOAD_ID,
};
use crate::fleetsync::workload::WorkloadStore;
use chrono::{DateTime, Utc};
use serde_json::json;

const COMPONENT: &str = "syncer-job";
const RESCHEDULING_MESSAGE: &str = "the workload is re-scheduling";
const MAX_FAILED_DETAILS: usize = 3;

/// Result of trying to record the node set of the current dispatch round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommit {
    /// Not every expected pod has been observed yet.
    Incomplete,
    Unchanged,
    Committed,
}

/// What a single observation does to the workload.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Nothing to write.
    Unchanged,
    /// Pod set still incomplete for a running resource.
    WaitForPods,
    /// Status-only write.
    Status(Workload),
    /// Status and annotations written together for the next round.
    Reschedule(Workload),
}

pub async fn handle_job(
    ctx: &ReconcileContext,
    store: &dyn WorkloadStore,
    gateway: &dyn ClusterGateway,
    message: &ChangeMessage,
    kind: JobLikeKind,
) -> Result<ReconcileOutcome, SyncError> {
    let workload = match store.get(&message.workload_id).await {
        Ok(workload) => workload,
        Err(err) if err.is_not_found() => return Ok(ReconcileOutcome::done()),
        Err(err) => return Err(err),
    };
    if workload.deletion_timestamp.is_some() {
        return Ok(ReconcileOutcome::done());
    }
    if !workload.is_dispatched() {
        return Ok(ReconcileOutcome::requeue_after(
            ctx.config().not_ready_requeue,
        ));
    }
    if message.is_stale(workload.dispatch_count()) {
        let current = workload.dispatch_count().to_string();
        let carried = message.dispatch_count.to_string();
        log_debug(
            COMPONENT,
            "Ignoring message from an earlier dispatch round",
            &[
                ("message", message.to_string().as_str()),
                ("current", current.as_str()),
                ("carried", carried.as_str()),
            ],
        );
        return Ok(ReconcileOutcome::done());
    }
    if workload.is_end() {
        return Ok(ReconcileOutcome::done());
    }

    let observed = if message.is_delete() {
        let selector = LabelSelector::single(LABEL_WORKLOAD_ID, &workload.id);
        let remaining = gateway.list_pods(&message.namespace, &selector).await?;
        if !remaining.is_empty() {
            return Ok(ReconcileOutcome::requeue_after(
                ctx.config().pod_deletion_requeue,
            ));
        }
        ObservedStatus::deleted(kind.as_str(), &message.name)
    } else {
        let object = match gateway
            .get_object(&message.gvk, &message.name, &message.namespace)
            .await
        {
            Ok(object) => object,
            Err(err) if err.is_not_found() => return Ok(ReconcileOutcome::done()),
            Err(err) => return Err(err),
        };
        status::observe(kind, object)?
    };

    match apply_observation(&workload, &observed, Utc::now()) {
        Transition::Unchanged => Ok(ReconcileOutcome::done()),
        Transition::WaitForPods => Ok(ReconcileOutcome::requeue_after(
            ctx.config().not_ready_requeue,
        )),
        Transition::Status(updated) => {
            let stored = store.update_status(&updated).await?;
            metrics::record_status_write(kind.as_str());
            log_debug(
                COMPONENT,
                "Workload status updated",
                &[
                    ("workload", stored.id.as_str()),
                    ("phase", stored.phase().map(WorkloadPhase::as_str).unwrap_or("")),
                ],
            );
            Ok(ReconcileOutcome::done())
        }
        Transition::Reschedule(updated) => {
            let stored = store.update(&updated).await?;
            metrics::record_status_write(kind.as_str());
            metrics::record_reschedule();
            let round = stored.dispatch_count().to_string();
            log_info(
                COMPONENT,
                "Workload re-scheduling",
                &[("workload", stored.id.as_str()), ("failedRound", round.as_str())],
            );
            Ok(ReconcileOutcome::done())
        }
    }
}

/// Computes the workload write implied by `observed`. Pure; the caller
/// persists the returned record.
pub fn apply_observation(
    workload: &Workload,
    observed: &ObservedStatus,
    now: DateTime<Utc>,
) -> Transition {
    if observed.is_pending() && workload.is_pending() {
        return Transition::Unchanged;
    }

    let mut updated = workload.clone();
    let end = is_workload_end(workload, observed);
    let commits_nodes = matches!(
        observed.phase,
        ObservedPhase::Running | ObservedPhase::Succeeded
    ) || observed.phase.is_failure();
    if commits_nodes
        && commit_nodes(&mut updated) == NodeCommit::Incomplete
        && observed.phase == ObservedPhase::Running
    {
        return Transition::WaitForPods;
    }

    if should_reschedule(workload, observed, end) {
        push_observed_condition(&mut updated, observed, now);
        reschedule(&mut updated, now);
        return Transition::Reschedule(updated);
    }

    if let Some(phase) = next_phase(workload, observed, end) {
        updated.status.phase = Some(phase);
    }
    if !observed.is_pending() {
        updated.status.start_time.get_or_insert(now);
        updated.status.message.clear();
    }
    if end || updated.phase() == Some(WorkloadPhase::Stopped) {
        updated.status.end_time.get_or_insert(now);
    }
    if !workload.is_stopping() {
        push_observed_condition(&mut updated, observed, now);
    }

    if updated.status == workload.status && updated.annotations == workload.annotations {
        Transition::Unchanged
    } else {
        Transition::Status(updated)
    }
}

/// True when `observed` finishes the workload for good.
pub fn is_workload_end(workload: &Workload, observed: &ObservedStatus) -> bool {
    if workload.kind() != WorkloadKind::Job || workload.is_preempted() {
        return false;
    }
    match observed.phase {
        ObservedPhase::Succeeded => true,
        ObservedPhase::Failed | ObservedPhase::Deleted => {
            let spec = &workload.spec;
            spec.max_retry == 0
                || workload.dispatch_count() > spec.max_retry
                || spec.disable_failover
        }
        _ => false,
    }
}

fn should_reschedule(workload: &Workload, observed: &ObservedStatus, end: bool) -> bool {
    if end || workload.is_stopping() {
        return false;
    }
    match workload.kind() {
        WorkloadKind::Job => observed.phase.is_failure(),
        WorkloadKind::Application => observed.phase == ObservedPhase::Deleted,
    }
}

fn next_phase(
    workload: &Workload,
    observed: &ObservedStatus,
    end: bool,
) -> Option<WorkloadPhase> {
    match observed.phase {
        ObservedPhase::Pending => Some(WorkloadPhase::Pending),
        ObservedPhase::Running if workload.is_stopping() => None,
        ObservedPhase::Running => Some(WorkloadPhase::Running),
        ObservedPhase::Succeeded if end => Some(WorkloadPhase::Succeeded),
        ObservedPhase::Succeeded => None,
        ObservedPhase::Deleted if workload.is_stopping() => Some(WorkloadPhase::Stopped),
        ObservedPhase::Failed | ObservedPhase::Deleted if end => Some(WorkloadPhase::Failed),
        ObservedPhase::Failed | ObservedPhase::Deleted
            if workload.is_running() && workload.kind() == WorkloadKind::Application =>
        {
            Some(WorkloadPhase::NotReady)
        }
        ObservedPhase::Failed | ObservedPhase::Deleted => None,
        ObservedPhase::Updating => Some(WorkloadPhase::Updating),
    }
}

fn push_observed_condition(workload: &mut Workload, observed: &ObservedStatus, now: DateTime<Utc>) {
    let mut message = observed.message.clone();
    if observed.phase == ObservedPhase::Failed {
        if let Some(details) = failed_pod_details(workload) {
            message.push_str(", details: ");
            message.push_str(&details);
        }
    }
    let reason = dispatch_reason(workload.dispatch_count());
    let condition = Condition::new(observed.phase.condition_type(), message, reason, now);
    let kind = workload.kind();
    workload.status.push_condition(kind, condition);
}

/// Records the node names of the current round into `status.nodes`.
pub fn commit_nodes(workload: &mut Workload) -> NodeCommit {
    let count = workload.dispatch_count() as usize;
    if count == 0 {
        return NodeCommit::Unchanged;
    }
    let observed = workload.status.pods.len();
    let complete = match workload.kind() {
        WorkloadKind::Job => observed == workload.spec.replica,
        WorkloadKind::Application => workload.spec.replica <= observed,
    };
    if !complete {
        return NodeCommit::Incomplete;
    }
    let slot = count - 1;
    if workload.kind() == WorkloadKind::Job
        && workload
            .status
            .nodes
            .get(slot)
            .is_some_and(|nodes| !nodes.is_empty())
    {
        return NodeCommit::Unchanged;
    }

    let mut pods: Vec<_> = workload.status.pods.iter().collect();
    pods.sort_by(|a, b| {
        a.host_ip
            .cmp(&b.host_ip)
            .then_with(|| a.pod_id.cmp(&b.pod_id))
    });
    let mut names: Vec<String> = Vec::with_capacity(pods.len());
    for pod in pods {
        if !names.contains(&pod.k8s_node_name) {
            names.push(pod.k8s_node_name.clone());
        }
    }

    let nodes = &mut workload.status.nodes;
    if nodes.len() < count {
        nodes.resize(slot, Vec::new());
        nodes.push(names);
        NodeCommit::Committed
    } else if nodes[slot] == names {
        NodeCommit::Unchanged
    } else {
        nodes[slot] = names;
        NodeCommit::Committed
    }
}

/// Resets the workload for its next dispatch round.
pub fn reschedule(workload: &mut Workload, now: DateTime<Utc>) {
    let count = workload.dispatch_count();
    let status = &mut workload.status;
    status.pods.clear();
    status.phase = Some(WorkloadPhase::Pending);
    status.nodes.resize(count as usize, Vec::new());
    status.nodes.push(Vec::new());
    let condition = Condition::new(
        ConditionType::AdminScheduling,
        RESCHEDULING_MESSAGE,
        dispatch_reason(count + 1),
        now,
    );
    let kind = workload.spec.kind;
    status.push_condition(kind, condition);

    workload.annotations.remove(ANNOTATION_DISPATCHED);
    workload.annotations.remove(ANNOTATION_SCHEDULED);
    workload
        .annotations
        .insert(ANNOTATION_RESCHEDULED.to_string(), String::new());
}

/// JSON array describing up to three failed pods of the current round.
pub fn failed_pod_details(workload: &Workload) -> Option<String> {
    let details: Vec<_> = workload
        .status
        .pods
        .iter()
        .filter(|pod| pod.phase == PodPhase::Failed)
        .take(MAX_FAILED_DETAILS)
        .map(|pod| {
            let container = pod
                .containers
                .iter()
                .find(|container| container.exit_code != 0)
                .map(|container| container.name.as_str())
                .unwrap_or_default();
            json!({
                "pod": pod.pod_id,
                "node": pod.k8s_node_name,
                "container": container,
            })
        })
        .collect();
    if details.is_empty() {
        return None;
    }
    serde_json::to_string(&details).ok()
}

/// Marks the workload Failed after an unrecoverable error. Idempotent.
pub async fn set_workload_failed(
    store: &dyn WorkloadStore,
    workload_id: &str,
    message: &str,
) -> Result<(), SyncError> {
    let workload = match store.get(workload_id).await {
        Ok(workload) => workload,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err),
    };
    if workload.is_end() {
        return Ok(());
    }
    let now = Utc::now();
    let mut updated = workload;
    updated.status.phase = Some(WorkloadPhase::Failed);
    updated.status.end_time.get_or_insert(now);
    updated.status.message = message.to_string();
    let condition = Condition::new(
        ConditionType::AdminFailed,
        message,
        dispatch_reason(updated.dispatch_count()),
        now,
    );
    let kind = updated.kind();
    updated.status.push_condition(kind, condition);
    store.update_status(&updated).await?;
    log_info(
        COMPONENT,
        "Workload failed",
        &[("workload", workload_id), ("message", message)],
    );
    Ok(())
}
