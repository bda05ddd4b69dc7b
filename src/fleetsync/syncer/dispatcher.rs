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

//! Routes a Change Message to the handler for its resource class and maps
//! handler errors onto queue decisions.

use super::cluster::ClusterRegistry;
use super::error::SyncError;
use super::message::{ChangeMessage, ResourceClass};
use super::{event, job, pod};
use crate::fleetsync::controller::reconcile::{ReconcileContext, ReconcileOutcome};
use crate::fleetsync::logger::{log_debug, log_error, log_warn};
use crate::fleetsync::observability::metrics::{self, MessageResult};
use crate::fleetsync::observability::tracing::with_span;
use crate::fleetsync::workload::WorkloadStore;
use std::sync::Arc;
use std::time::Instant;

const COMPONENT: &str = "syncer";

pub struct Dispatcher {
    registry: Arc<ClusterRegistry>,
    store: Arc<dyn WorkloadStore>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ClusterRegistry>, store: Arc<dyn WorkloadStore>) -> Self {
        Self { registry, store }
    }

    /// Handles one message. `Err` means the message should be retried with
    /// backoff; everything else is expressed through the outcome.
    pub async fn dispatch(
        &self,
        ctx: &ReconcileContext,
        message: &ChangeMessage,
    ) -> Result<ReconcileOutcome, SyncError> {
        let started = Instant::now();
        let Some(class) = message.resource_class() else {
            log_warn(
                COMPONENT,
                "Dropping message for unsupported kind",
                &[("message", message.to_string().as_str())],
            );
            metrics::record_message("unknown", MessageResult::Dropped, started.elapsed());
            return Ok(ReconcileOutcome::done());
        };

        let span_name = format!("{} {}", class.label(), message);
        let result = with_span(COMPONENT, span_name, self.route(ctx, class, message)).await;
        let (outcome, recorded) = match result {
            Ok(outcome) if outcome.is_requeue() => (Ok(outcome), MessageResult::Requeue),
            Ok(outcome) => (Ok(outcome), MessageResult::Success),
            Err(err) if err.is_non_retryable() => {
                log_warn(
                    COMPONENT,
                    "Dropping message after non-retryable error",
                    &[
                        ("message", message.to_string().as_str()),
                        ("class", err.class()),
                        ("error", err.to_string().as_str()),
                    ],
                );
                (Ok(ReconcileOutcome::done()), MessageResult::Dropped)
            }
            Err(err) if err.is_unrecoverable() => {
                log_error(
                    COMPONENT,
                    "Unrecoverable error, failing workload",
                    &[
                        ("message", message.to_string().as_str()),
                        ("workload", message.workload_id.as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
                let failed = job::set_workload_failed(
                    self.store.as_ref(),
                    &message.workload_id,
                    &err.detail(),
                )
                .await;
                match failed {
                    Ok(()) => (Ok(ReconcileOutcome::done()), MessageResult::Dropped),
                    Err(write_err) => (Err(write_err), MessageResult::Error),
                }
            }
            Err(err) => {
                log_debug(
                    COMPONENT,
                    "Handler failed",
                    &[
                        ("message", message.to_string().as_str()),
                        ("class", err.class()),
                    ],
                );
                (Err(err), MessageResult::Error)
            }
        };
        metrics::record_message(class.label(), recorded, started.elapsed());
        outcome
    }

    async fn route(
        &self,
        ctx: &ReconcileContext,
        class: ResourceClass,
        message: &ChangeMessage,
    ) -> Result<ReconcileOutcome, SyncError> {
        let Some(gateway) = self.registry.get(&message.cluster) else {
            log_debug(
                COMPONENT,
                "Cluster not registered yet",
                &[("cluster", message.cluster.as_str())],
            );
            return Ok(ReconcileOutcome::requeue_after(
                ctx.config().not_ready_requeue,
            ));
        };
        let store = self.store.as_ref();
        match class {
            ResourceClass::JobLike(kind) => {
                job::handle_job(ctx, store, gateway.as_ref(), message, kind).await
            }
            ResourceClass::Pod => pod::handle_pod(ctx, store, gateway.as_ref(), message).await,
            ResourceClass::Event => event::handle_event(store, gateway.as_ref(), message).await,
        }
    }
}
