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

//! The syncer: a pool of workers draining Change Messages from member
//! clusters and reconciling them into Logical Workloads.

pub mod cluster;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod job;
pub mod message;
pub mod pod;
pub mod status;

pub use job::set_workload_failed;

use crate::fleetsync::config::{ConfigError, SyncerConfig};
use crate::fleetsync::controller::reconcile::ReconcileContext;
use crate::fleetsync::controller::runtime::{spawn_workers, WorkQueue};
use crate::fleetsync::logger::{log_info, log_warn, set_log_format};
use crate::fleetsync::observability::tracing as fleet_tracing;
use crate::fleetsync::workload::WorkloadStore;
use cluster::{ClusterGateway, ClusterRegistry};
use dispatcher::Dispatcher;
use error::SyncError;
use message::ChangeMessage;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "syncer";

/// A queued message and how many times it failed so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub message: ChangeMessage,
    pub attempts: u32,
}

impl WorkItem {
    pub fn new(message: ChangeMessage) -> Self {
        Self {
            message,
            attempts: 0,
        }
    }
}

pub struct Syncer {
    registry: Arc<ClusterRegistry>,
    dispatcher: Arc<Dispatcher>,
    queue: WorkQueue<WorkItem>,
    config: Arc<SyncerConfig>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Syncer {
    pub fn new(config: SyncerConfig, store: Arc<dyn WorkloadStore>) -> Self {
        let registry = Arc::new(ClusterRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), store));
        Self {
            registry,
            dispatcher,
            queue: WorkQueue::new(config.queue_capacity),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn from_env(store: Arc<dyn WorkloadStore>) -> Result<Self, ConfigError> {
        Ok(Self::new(SyncerConfig::from_env()?, store))
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    /// Makes `gateway` reachable for messages from cluster `name`. Messages
    /// that arrived earlier are waiting in the requeue loop and pick it up.
    pub fn register_cluster(&self, name: &str, gateway: Arc<dyn ClusterGateway>) {
        if self.registry.add(name, gateway).is_some() {
            log_info(COMPONENT, "Cluster gateway replaced", &[("cluster", name)]);
        } else {
            log_info(COMPONENT, "Cluster registered", &[("cluster", name)]);
        }
    }

    pub fn remove_cluster(&self, name: &str) -> bool {
        let removed = self.registry.remove(name).is_some();
        if removed {
            log_info(COMPONENT, "Cluster removed", &[("cluster", name)]);
        }
        removed
    }

    pub fn config(&self) -> &SyncerConfig {
        &self.config
    }

    pub async fn enqueue(&self, message: ChangeMessage) -> Result<(), SyncError> {
        self.queue
            .enqueue(WorkItem::new(message))
            .await
            .map_err(|_| SyncError::transient("syncer queue is closed"))
    }

    /// Starts the worker pool. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock().expect("syncer workers poisoned");
        if !workers.is_empty() {
            return;
        }
        set_log_format(self.config.log_format);
        fleet_tracing::init();

        let dispatcher = Arc::clone(&self.dispatcher);
        let queue = self.queue.clone();
        let config = Arc::clone(&self.config);
        let shutdown = self.shutdown.clone();
        *workers = spawn_workers(
            self.queue.clone(),
            self.config.workers,
            self.shutdown.clone(),
            move |item| {
                process(
                    Arc::clone(&dispatcher),
                    queue.clone(),
                    Arc::clone(&config),
                    shutdown.clone(),
                    item,
                )
            },
        );
        let count = self.config.workers.to_string();
        log_info(COMPONENT, "Syncer started", &[("workers", count.as_str())]);
    }

    /// Stops the workers and drops pending delayed deliveries.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().expect("syncer workers poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                log_warn(
                    COMPONENT,
                    "Worker exited abnormally",
                    &[("error", err.to_string().as_str())],
                );
            }
        }
        log_info(COMPONENT, "Syncer stopped", &[]);
    }
}

async fn process(
    dispatcher: Arc<Dispatcher>,
    queue: WorkQueue<WorkItem>,
    config: Arc<SyncerConfig>,
    shutdown: CancellationToken,
    item: WorkItem,
) {
    let ctx = ReconcileContext::with_token(shutdown.child_token(), Arc::clone(&config));
    match dispatcher.dispatch(&ctx, &item.message).await {
        Ok(outcome) => {
            if let Some(delay) = outcome.requeue_after {
                queue.enqueue_after(WorkItem::new(item.message), delay, shutdown);
            }
        }
        Err(err) => {
            let delay = config.error_backoff(item.attempts);
            let attempts = (item.attempts + 1).to_string();
            log_warn(
                COMPONENT,
                "Message failed, retrying",
                &[
                    ("message", item.message.to_string().as_str()),
                    ("attempts", attempts.as_str()),
                    ("class", err.class()),
                    ("error", err.to_string().as_str()),
                ],
            );
            let retry = WorkItem {
                message: item.message,
                attempts: item.attempts + 1,
            };
            queue.enqueue_after(retry, delay, shutdown);
        }
    }
}
