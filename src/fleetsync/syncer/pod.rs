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

//! Pod reconciliation: keeps the per-pod records on the workload current and
//! force-deletes pods stuck in termination.

use super::cluster::ClusterGateway;
use super::error::SyncError;
use super::message::ChangeMessage;
use crate::fleetsync::controller::delete::DeleteOptions;
use crate::fleetsync::controller::reconcile::{ReconcileContext, ReconcileOutcome};
use crate::fleetsync::k8s::pod::{Pod, PodPhase};
use crate::fleetsync::k8s::{from_object, parse_timestamp};
use crate::fleetsync::logger::{log_debug, log_info, log_warn};
use crate::fleetsync::observability::metrics;
use crate::fleetsync::workload::types::{
    ContainerTermination, PodRecord, Workload, WorkloadKind, LABEL_ADMIN_NODE,
};
use crate::fleetsync::workload::WorkloadStore;
use chrono::{DateTime, Utc};

const COMPONENT: &str = "syncer-pod";
const RANK_ENV: &str = "RANK";
const OPS_LOG_TAIL_LINES: usize = 1000;
const OPS_LOG_MARKERS: [&str; 2] = ["[ERROR]", "[SUCCESS]"];

pub async fn handle_pod(
    ctx: &ReconcileContext,
    store: &dyn WorkloadStore,
    gateway: &dyn ClusterGateway,
    message: &ChangeMessage,
) -> Result<ReconcileOutcome, SyncError> {
    if message.is_delete() {
        remove_pod_record(store, &message.workload_id, &message.name).await?;
        return Ok(ReconcileOutcome::done());
    }
    let object = match gateway
        .get_object(&message.gvk, &message.name, &message.namespace)
        .await
    {
        Ok(object) => object,
        Err(err) if err.is_not_found() => {
            remove_pod_record(store, &message.workload_id, &message.name).await?;
            return Ok(ReconcileOutcome::done());
        }
        Err(err) => return Err(err),
    };
    let pod: Pod = from_object(object)
        .map_err(|err| SyncError::non_retryable(format!("failed to parse pod {message}: {err}")))?;

    if let Some(deleted_at) = pod.metadata.deleted_at() {
        remove_pod_record(store, &message.workload_id, &message.name).await?;
        return force_delete_stuck_pod(ctx, gateway, &message.cluster, &pod, deleted_at).await;
    }

    let workload = match store.get(&message.workload_id).await {
        Ok(workload) => workload,
        Err(err) if err.is_not_found() => return Ok(ReconcileOutcome::done()),
        Err(err) => return Err(err),
    };
    if !workload.is_dispatched() {
        return Ok(ReconcileOutcome::requeue_after(
            ctx.config().not_ready_requeue,
        ));
    }
    if message.is_stale(workload.dispatch_count()) || workload.is_end() {
        return Ok(ReconcileOutcome::done());
    }

    let node_name = pod.spec.node_name.clone().unwrap_or_default();
    let start_time = pod.status.as_ref().and_then(|status| status.start_time.clone());
    if let Some(existing) = workload.status.pod(pod.metadata.name()) {
        if existing.phase == pod.phase()
            && existing.k8s_node_name == node_name
            && existing.start_time == start_time
        {
            return Ok(ReconcileOutcome::done());
        }
    }

    let mut record = build_record(&pod, &workload);
    record.admin_node_name = resolve_admin_node(gateway, &node_name).await?;
    if workload.spec.ops_job && record.phase.is_finished() {
        attach_ops_log(ctx, gateway, &pod, &workload, &mut record).await?;
    }

    let mut updated = workload;
    upsert_pod(&mut updated, record);
    store.update_status(&updated).await?;
    metrics::record_status_write("Pod");
    Ok(ReconcileOutcome::done())
}

/// Builds the record for `pod` from its spec and status alone.
pub fn build_record(pod: &Pod, workload: &Workload) -> PodRecord {
    let mut record = PodRecord::new(pod.metadata.name(), pod.phase());
    record.k8s_node_name = pod.spec.node_name.clone().unwrap_or_default();
    record.rank = pod
        .container(&workload.spec.main_container)
        .and_then(|container| container.env_value(RANK_ENV))
        .unwrap_or_default()
        .to_string();
    if let Some(status) = pod.status.as_ref() {
        record.host_ip = status.host_ip.clone().unwrap_or_default();
        record.pod_ip = status.pod_ip.clone().unwrap_or_default();
        record.start_time = status.start_time.clone();
    }
    if record.phase.is_finished() {
        apply_termination(pod, workload.spec.ops_job, &mut record);
    }
    record
}

fn apply_termination(pod: &Pod, ops_job: bool, record: &mut PodRecord) {
    let Some(status) = pod.status.as_ref() else {
        return;
    };
    let mut latest: Option<(DateTime<Utc>, &str)> = None;
    for container in &status.container_statuses {
        let Some(finished) = container
            .terminated()
            .and_then(|terminated| terminated.finished_at.as_deref())
        else {
            continue;
        };
        if let Some(parsed) = parse_timestamp(finished) {
            if latest.map_or(true, |(current, _)| parsed > current) {
                latest = Some((parsed, finished));
            }
        }
    }
    record.end_time = latest.map(|(_, raw)| raw.to_string());

    if record.phase == PodPhase::Failed || ops_job {
        record.containers = status
            .container_statuses
            .iter()
            .filter_map(|container| {
                let terminated = container.terminated()?;
                Some(ContainerTermination {
                    name: container.name.clone(),
                    reason: terminated.reason.clone().unwrap_or_default(),
                    message: terminated.message.clone().unwrap_or_default(),
                    exit_code: terminated.exit_code,
                    signal: terminated.signal,
                })
            })
            .collect();
    }
    if record.phase == PodPhase::Failed {
        record.failed_message = match (status.reason.as_deref(), status.message.as_deref()) {
            (Some(reason), Some(message)) => format!("{reason}: {message}"),
            (Some(text), None) | (None, Some(text)) => text.to_string(),
            (None, None) => String::new(),
        };
    }
}

async fn resolve_admin_node(
    gateway: &dyn ClusterGateway,
    node_name: &str,
) -> Result<String, SyncError> {
    if node_name.is_empty() {
        return Ok(String::new());
    }
    match gateway.get_node(node_name).await {
        Ok(node) => Ok(node.label(LABEL_ADMIN_NODE).unwrap_or_default().to_string()),
        Err(err) if err.is_not_found() => Ok(String::new()),
        Err(err) => Err(err),
    }
}

async fn attach_ops_log(
    ctx: &ReconcileContext,
    gateway: &dyn ClusterGateway,
    pod: &Pod,
    workload: &Workload,
    record: &mut PodRecord,
) -> Result<(), SyncError> {
    let container = workload.spec.main_container.as_str();
    let fetch = gateway.pod_logs(
        pod.metadata.namespace(),
        pod.metadata.name(),
        container,
        OPS_LOG_TAIL_LINES,
    );
    let log = tokio::select! {
        _ = ctx.cancellation_token().cancelled() => {
            return Err(SyncError::transient("log fetch cancelled"));
        }
        log = fetch => log,
    };
    let log = match log {
        Ok(log) => log,
        Err(err) => {
            log_warn(
                COMPONENT,
                "Failed to fetch ops job log",
                &[
                    ("pod", pod.metadata.name()),
                    ("error", err.to_string().as_str()),
                ],
            );
            return Ok(());
        }
    };
    let Some(summary) = summarize_ops_log(&log) else {
        return Ok(());
    };
    match record
        .containers
        .iter_mut()
        .find(|entry| entry.name == container)
    {
        Some(entry) => entry.message = summary,
        // No termination entry for the main container (evicted before it
        // ran, for instance): keep the summary on the pod itself.
        None => {
            log_debug(
                COMPONENT,
                "Main container not terminated, attaching ops log to pod",
                &[("pod", pod.metadata.name()), ("container", container)],
            );
            if record.failed_message.is_empty() {
                record.failed_message = summary;
            } else {
                record.failed_message = format!("{}, log: {summary}", record.failed_message);
            }
        }
    }
    Ok(())
}

/// JSON array of the log lines carrying an ops result marker.
pub fn summarize_ops_log(log: &str) -> Option<String> {
    let lines: Vec<&str> = log
        .lines()
        .filter(|line| OPS_LOG_MARKERS.iter().any(|marker| line.contains(marker)))
        .collect();
    if lines.is_empty() {
        return None;
    }
    serde_json::to_string(&lines).ok()
}

fn upsert_pod(workload: &mut Workload, record: PodRecord) {
    let pods = &mut workload.status.pods;
    match pods.iter_mut().find(|pod| pod.pod_id == record.pod_id) {
        Some(existing) => *existing = record,
        None => pods.push(record),
    }
}

/// Drops the record for `pod_id`. Finished workloads and Job-kind
/// workloads keep their records.
async fn remove_pod_record(
    store: &dyn WorkloadStore,
    workload_id: &str,
    pod_id: &str,
) -> Result<(), SyncError> {
    let workload = match store.get(workload_id).await {
        Ok(workload) => workload,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err),
    };
    if workload.is_end()
        || workload.kind() == WorkloadKind::Job
        || workload.status.pod(pod_id).is_none()
    {
        return Ok(());
    }
    let mut updated = workload;
    updated.status.pods.retain(|pod| pod.pod_id != pod_id);
    store.update_status(&updated).await?;
    metrics::record_status_write("Pod");
    Ok(())
}

async fn force_delete_stuck_pod(
    ctx: &ReconcileContext,
    gateway: &dyn ClusterGateway,
    cluster: &str,
    pod: &Pod,
    deleted_at: DateTime<Utc>,
) -> Result<ReconcileOutcome, SyncError> {
    let age = (Utc::now() - deleted_at).to_std().unwrap_or_default();
    if age < ctx.config().force_delete_delay {
        return Ok(ReconcileOutcome::requeue_after(
            ctx.config().pod_deletion_requeue,
        ));
    }
    match gateway
        .delete_pod(
            pod.metadata.namespace(),
            pod.metadata.name(),
            DeleteOptions::force(),
        )
        .await
    {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err),
    }
    metrics::record_force_delete(cluster);
    log_info(
        COMPONENT,
        "Force deleted terminating pod",
        &[
            ("cluster", cluster),
            ("namespace", pod.metadata.namespace()),
            ("pod", pod.metadata.name()),
        ],
    );
    Ok(ReconcileOutcome::done())
}
