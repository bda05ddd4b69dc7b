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

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static SYNCER_MESSAGES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static SYNCER_HANDLE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static WORKLOAD_STATUS_WRITES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WORKLOAD_RESCHEDULES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static POD_FORCE_DELETES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static STAGED_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("fleetsync".to_string()), None)
            .expect("failed to initialise fleetsync metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register fleetsync metric collector");
    collector
}

fn syncer_messages_total() -> &'static IntCounterVec {
    SYNCER_MESSAGES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "messages_total",
            "Change messages handled by the syncer grouped by resource class and result",
        )
        .subsystem("syncer");
        let counter = IntCounterVec::new(opts, &["kind", "result"])
            .expect("failed to build syncer message counter");
        register_collector(counter)
    })
}

fn syncer_handle_duration() -> &'static HistogramVec {
    SYNCER_HANDLE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "handle_duration_seconds",
            "Latency distribution for a single change message dispatch",
        )
        .subsystem("syncer")
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]);
        let histogram = HistogramVec::new(opts, &["kind"])
            .expect("failed to build syncer handle histogram");
        register_collector(histogram)
    })
}

fn workload_status_writes_total() -> &'static IntCounterVec {
    WORKLOAD_STATUS_WRITES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "status_writes_total",
            "Conditional workload status writes issued by the syncer",
        )
        .subsystem("workload");
        let counter = IntCounterVec::new(opts, &["kind"])
            .expect("failed to build workload status write counter");
        register_collector(counter)
    })
}

fn workload_reschedules_total() -> &'static IntCounter {
    WORKLOAD_RESCHEDULES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "reschedules_total",
            "Workloads handed back to the scheduler for another dispatch round",
        )
        .subsystem("workload");
        let counter = IntCounter::with_opts(opts).expect("failed to build reschedule counter");
        register_collector(counter)
    })
}

fn pod_force_deletes_total() -> &'static IntCounterVec {
    POD_FORCE_DELETES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "force_deletes_total",
            "Pods force deleted after their deletion grace window elapsed",
        )
        .subsystem("pod");
        let counter = IntCounterVec::new(opts, &["cluster"])
            .expect("failed to build pod force delete counter");
        register_collector(counter)
    })
}

fn staged_reconciles_total() -> &'static IntCounterVec {
    STAGED_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "staged_reconciles_total",
            "Staged controller reconciliation passes grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build staged reconcile counter");
        register_collector(counter)
    })
}

/// Outcome label for a dispatched change message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageResult {
    Success,
    Requeue,
    Dropped,
    Error,
}

impl MessageResult {
    fn as_label(self) -> &'static str {
        match self {
            MessageResult::Success => "success",
            MessageResult::Requeue => "requeue",
            MessageResult::Dropped => "dropped",
            MessageResult::Error => "error",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StagedResult {
    Success,
    Skipped,
    Completed,
    Error,
}

impl StagedResult {
    fn as_label(self) -> &'static str {
        match self {
            StagedResult::Success => "success",
            StagedResult::Skipped => "skipped",
            StagedResult::Completed => "completed",
            StagedResult::Error => "error",
        }
    }
}

pub fn record_message(kind: &str, result: MessageResult, elapsed: Duration) {
    syncer_messages_total()
        .with_label_values(&[kind, result.as_label()])
        .inc();
    syncer_handle_duration()
        .with_label_values(&[kind])
        .observe(elapsed.as_secs_f64());
}

pub fn record_status_write(kind: &str) {
    workload_status_writes_total()
        .with_label_values(&[kind])
        .inc();
}

pub fn record_reschedule() {
    workload_reschedules_total().inc();
}

pub fn record_force_delete(cluster: &str) {
    let cluster = if cluster.is_empty() { "unknown" } else { cluster };
    pod_force_deletes_total()
        .with_label_values(&[cluster])
        .inc();
}

pub fn record_staged_reconcile(controller: &str, result: StagedResult) {
    staged_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
}

/// Renders every registered collector in the Prometheus text format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}
