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

//! Surfaces image-pull and start-up problems reported as Kubernetes events
//! on the message of a workload that is still pending.

use super::cluster::ClusterGateway;
use super::error::SyncError;
use super::message::ChangeMessage;
use crate::fleetsync::controller::reconcile::ReconcileOutcome;
use crate::fleetsync::k8s::event::{Event, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::fleetsync::k8s::from_object;
use crate::fleetsync::logger::log_debug;
use crate::fleetsync::observability::metrics;
use crate::fleetsync::workload::WorkloadStore;

const COMPONENT: &str = "syncer-event";
const REASON_PULLING: &str = "Pulling";
const REASON_PULLED: &str = "Pulled";
const PULLING_PREFIX: &str = "Pulling image";
const WARNING_REASONS: [&str; 2] = ["BackOff", "FreeDiskSpaceFailed"];
const SUPPRESSED_FRAGMENT: &str = "already exists";

pub async fn handle_event(
    store: &dyn WorkloadStore,
    gateway: &dyn ClusterGateway,
    message: &ChangeMessage,
) -> Result<ReconcileOutcome, SyncError> {
    if message.is_delete() {
        return Ok(ReconcileOutcome::done());
    }
    let object = match gateway
        .get_object(&message.gvk, &message.name, &message.namespace)
        .await
    {
        Ok(object) => object,
        Err(err) if err.is_not_found() => return Ok(ReconcileOutcome::done()),
        Err(err) => return Err(err),
    };
    let event: Event = from_object(object).map_err(|err| {
        SyncError::non_retryable(format!("failed to parse event {message}: {err}"))
    })?;
    if !is_relevant(&event) {
        return Ok(ReconcileOutcome::done());
    }

    let workload = match store.get(&message.workload_id).await {
        Ok(workload) => workload,
        Err(err) if err.is_not_found() => return Ok(ReconcileOutcome::done()),
        Err(err) => return Err(err),
    };
    if !workload.is_pending() || message.is_stale(workload.dispatch_count()) {
        return Ok(ReconcileOutcome::done());
    }
    let Some(next) = build_pending_message(&workload.status.message, &event) else {
        return Ok(ReconcileOutcome::done());
    };

    log_debug(
        COMPONENT,
        "Pending message updated",
        &[
            ("workload", workload.id.as_str()),
            ("reason", event.reason()),
        ],
    );
    let mut updated = workload;
    updated.status.message = next;
    store.update_status(&updated).await?;
    metrics::record_status_write("Event");
    Ok(ReconcileOutcome::done())
}

/// Pod events worth showing to the user: image pulls and failures.
pub fn is_relevant(event: &Event) -> bool {
    if event.involved_kind() != "Pod" {
        return false;
    }
    let reason = event.reason();
    match event.event_type() {
        EVENT_TYPE_NORMAL => reason == REASON_PULLING || reason == REASON_PULLED,
        EVENT_TYPE_WARNING => reason.starts_with("Failed") || WARNING_REASONS.contains(&reason),
        _ => false,
    }
}

/// Next value of the pending message, or `None` when nothing changes.
pub fn build_pending_message(current: &str, event: &Event) -> Option<String> {
    if event.reason() == REASON_PULLED {
        return current.starts_with(PULLING_PREFIX).then(String::new);
    }
    let message = event.message();
    if message.is_empty() || message == current || message.contains(SUPPRESSED_FRAGMENT) {
        return None;
    }
    Some(message.to_string())
}
