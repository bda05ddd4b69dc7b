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

//! Fixtures shared by unit and scenario tests: an in-memory cluster gateway
//! and builders for the JSON objects member clusters return.

use crate::fleetsync::config::SyncerConfig;
use crate::fleetsync::controller::delete::DeleteOptions;
use crate::fleetsync::controller::reconcile::{ReconcileContext, ReconcileOutcome};
use crate::fleetsync::k8s::node::Node;
use crate::fleetsync::k8s::pod::Pod;
use crate::fleetsync::k8s::statefulset::LabelSelector;
use crate::fleetsync::syncer::cluster::{ClusterGateway, ClusterRegistry};
use crate::fleetsync::syncer::dispatcher::Dispatcher;
use crate::fleetsync::syncer::error::{SyncError, SyncFuture};
use crate::fleetsync::syncer::message::{ChangeMessage, GroupVersionKind, ResourceAction};
use crate::fleetsync::workload::types::{Workload, WorkloadSpec, LABEL_WORKLOAD_ID};
use crate::fleetsync::workload::InMemoryWorkloadStore;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const TEST_CLUSTER: &str = "cluster-a";
pub const TEST_NAMESPACE: &str = "team-a";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Timestamp `seconds` in the past, formatted like the API server does.
pub fn seconds_ago(seconds: i64) -> String {
    rfc3339(Utc::now() - Duration::seconds(seconds))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCall {
    pub namespace: String,
    pub name: String,
    pub options: DeleteOptions,
}

type ObjectKey = (String, String, String);

/// In-memory [`ClusterGateway`] with call recording.
#[derive(Default)]
pub struct FakeClusterGateway {
    objects: Mutex<HashMap<ObjectKey, Value>>,
    nodes: Mutex<HashMap<String, Node>>,
    logs: Mutex<HashMap<ObjectKey, String>>,
    deletes: Mutex<Vec<DeleteCall>>,
    get_failures: Mutex<VecDeque<String>>,
    get_calls: AtomicUsize,
    log_calls: AtomicUsize,
    stall_logs: AtomicBool,
}

impl FakeClusterGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object keyed by its `kind`, namespace and name.
    pub fn put(&self, object: Value) {
        let key = (
            object["kind"].as_str().unwrap_or_default().to_string(),
            object["metadata"]["namespace"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            object["metadata"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        );
        lock(&self.objects).insert(key, object);
    }

    pub fn remove(&self, kind: &str, namespace: &str, name: &str) {
        let key = (kind.to_string(), namespace.to_string(), name.to_string());
        lock(&self.objects).remove(&key);
    }

    pub fn put_node(&self, node: Node) {
        lock(&self.nodes).insert(node.metadata.name().to_string(), node);
    }

    pub fn set_log(&self, namespace: &str, pod: &str, container: &str, log: &str) {
        lock(&self.logs).insert(
            (namespace.to_string(), pod.to_string(), container.to_string()),
            log.to_string(),
        );
    }

    /// The next `get_object` call fails with a transient error.
    pub fn fail_next_get(&self, message: &str) {
        lock(&self.get_failures).push_back(message.to_string());
    }

    /// Log fetches never complete until the caller gives up.
    pub fn stall_logs(&self) {
        self.stall_logs.store(true, Ordering::SeqCst);
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        lock(&self.deletes).clone()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }
}

impl ClusterGateway for FakeClusterGateway {
    fn get_object<'a>(
        &'a self,
        gvk: &'a GroupVersionKind,
        name: &'a str,
        namespace: &'a str,
    ) -> SyncFuture<'a, Value> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let result = match lock(&self.get_failures).pop_front() {
            Some(message) => Err(SyncError::transient(message)),
            None => lock(&self.objects)
                .get(&(gvk.kind.clone(), namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| {
                    SyncError::not_found(format!("{} {namespace}/{name}", gvk.kind))
                }),
        };
        Box::pin(async move { result })
    }

    fn delete_pod<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        options: DeleteOptions,
    ) -> SyncFuture<'a, ()> {
        lock(&self.deletes).push(DeleteCall {
            namespace: namespace.to_string(),
            name: name.to_string(),
            options,
        });
        let removed = lock(&self.objects).remove(&(
            "Pod".to_string(),
            namespace.to_string(),
            name.to_string(),
        ));
        let result = match removed {
            Some(_) => Ok(()),
            None => Err(SyncError::not_found(format!("Pod {namespace}/{name}"))),
        };
        Box::pin(async move { result })
    }

    fn list_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> SyncFuture<'a, Vec<Pod>> {
        let result = lock(&self.objects)
            .iter()
            .filter(|((kind, ns, _), _)| kind == "Pod" && ns == namespace)
            .map(|(_, value)| serde_json::from_value::<Pod>(value.clone()))
            .filter(|pod| match pod {
                Ok(pod) => selector.matches(&pod.metadata.labels),
                Err(_) => true,
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(SyncError::from);
        Box::pin(async move { result })
    }

    fn get_node<'a>(&'a self, name: &'a str) -> SyncFuture<'a, Node> {
        let result = lock(&self.nodes)
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("Node {name}")));
        Box::pin(async move { result })
    }

    fn pod_logs<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        container: &'a str,
        tail_lines: usize,
    ) -> SyncFuture<'a, String> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_logs.load(Ordering::SeqCst) {
            return Box::pin(futures_util::future::pending::<Result<String, SyncError>>());
        }
        let log = lock(&self.logs)
            .get(&(namespace.to_string(), name.to_string(), container.to_string()))
            .cloned()
            .unwrap_or_default();
        let lines: Vec<&str> = log.lines().collect();
        let start = lines.len().saturating_sub(tail_lines);
        let result = Ok(lines[start..].join("\n"));
        Box::pin(async move { result })
    }
}

/// Job-kind workload already placed for its first dispatch round.
pub fn dispatched_job_workload(id: &str, replica: usize, max_retry: u32) -> Workload {
    let mut spec = WorkloadSpec::new("Job", replica);
    spec.max_retry = max_retry;
    let mut workload = Workload::new(id, spec);
    workload.mark_dispatched();
    workload
}

pub fn dispatched_application_workload(id: &str, resource_kind: &str, replica: usize) -> Workload {
    let mut workload = Workload::new(id, WorkloadSpec::new(resource_kind, replica));
    workload.mark_dispatched();
    workload
}

/// Builder for Pod objects as a member cluster would return them.
#[derive(Debug, Clone)]
pub struct PodFixture {
    object: Value,
}

impl PodFixture {
    pub fn new(namespace: &str, name: &str, workload_id: &str) -> Self {
        Self {
            object: json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": name,
                    "namespace": namespace,
                    "uid": format!("uid-{name}"),
                    "labels": { LABEL_WORKLOAD_ID: workload_id },
                },
                "spec": { "containers": [{ "name": "main" }] },
                "status": { "phase": "Pending" },
            }),
        }
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.object["status"]["phase"] = json!(phase);
        self
    }

    /// Schedules the pod onto `node` with the given host IP.
    pub fn on_node(mut self, node: &str, host_ip: &str) -> Self {
        self.object["spec"]["nodeName"] = json!(node);
        self.object["status"]["hostIP"] = json!(host_ip);
        let suffix = host_ip.rsplit('.').next().unwrap_or("0");
        self.object["status"]["podIP"] = json!(format!("172.16.0.{suffix}"));
        self
    }

    pub fn started(mut self, start_time: &str) -> Self {
        self.object["status"]["startTime"] = json!(start_time);
        self
    }

    pub fn rank(mut self, rank: &str) -> Self {
        self.object["spec"]["containers"][0]["env"] =
            json!([{ "name": "RANK", "value": rank }]);
        self
    }

    pub fn terminated(
        mut self,
        container: &str,
        exit_code: i32,
        reason: &str,
        finished_at: &str,
    ) -> Self {
        let status = json!({
            "name": container,
            "state": { "terminated": {
                "exitCode": exit_code,
                "reason": reason,
                "message": format!("{container} exited with {exit_code}"),
                "finishedAt": finished_at,
            }},
        });
        match self.object["status"]["containerStatuses"].as_array_mut() {
            Some(statuses) => statuses.push(status),
            None => self.object["status"]["containerStatuses"] = json!([status]),
        }
        self
    }

    pub fn deleted_at(mut self, timestamp: &str) -> Self {
        self.object["metadata"]["deletionTimestamp"] = json!(timestamp);
        self
    }

    pub fn build(self) -> Value {
        self.object
    }
}

/// A batch Job object with the given status block.
pub fn batch_job(namespace: &str, name: &str, status: Value) -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": { "name": name, "namespace": namespace, "generation": 1 },
        "spec": { "parallelism": 1 },
        "status": status,
    })
}

pub fn event_object(
    namespace: &str,
    name: &str,
    involved_kind: &str,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Event",
        "metadata": { "name": name, "namespace": namespace },
        "involvedObject": {
            "kind": involved_kind,
            "name": format!("{name}-target"),
            "namespace": namespace,
        },
        "type": event_type,
        "reason": reason,
        "message": message,
    })
}

/// One workload, one fake member cluster and a dispatcher wired to both.
pub struct SyncHarness {
    pub workload_id: String,
    pub store: Arc<InMemoryWorkloadStore>,
    pub gateway: Arc<FakeClusterGateway>,
    pub registry: Arc<ClusterRegistry>,
    pub dispatcher: Dispatcher,
    ctx: ReconcileContext,
}

impl SyncHarness {
    pub fn new(workload: Workload) -> Self {
        Self::with_config(workload, SyncerConfig::default())
    }

    pub fn with_config(workload: Workload, config: SyncerConfig) -> Self {
        let store = Arc::new(InMemoryWorkloadStore::new());
        let workload = store.insert(workload);
        let gateway = Arc::new(FakeClusterGateway::new());
        let registry = Arc::new(ClusterRegistry::new());
        registry.add(TEST_CLUSTER, gateway.clone());
        let dispatcher = Dispatcher::new(registry.clone(), store.clone());
        Self {
            workload_id: workload.id,
            store,
            gateway,
            registry,
            dispatcher,
            ctx: ReconcileContext::new(Arc::new(config)),
        }
    }

    pub fn context(&self) -> &ReconcileContext {
        &self.ctx
    }

    /// Message for `name` stamped with the workload's current round.
    pub fn message(
        &self,
        gvk: GroupVersionKind,
        name: &str,
        action: ResourceAction,
    ) -> ChangeMessage {
        let round = self.workload().dispatch_count();
        ChangeMessage::new(
            TEST_CLUSTER,
            gvk,
            TEST_NAMESPACE,
            name,
            &self.workload_id,
            action,
        )
        .with_dispatch_count(round)
    }

    pub async fn deliver(&self, message: &ChangeMessage) -> ReconcileOutcome {
        self.dispatcher
            .dispatch(&self.ctx, message)
            .await
            .unwrap_or_else(|err| panic!("dispatch of {message} failed: {err}"))
    }

    pub fn workload(&self) -> Workload {
        self.store
            .snapshot(&self.workload_id)
            .unwrap_or_else(|| panic!("workload {} missing", self.workload_id))
    }

    pub fn write_count(&self) -> usize {
        self.store.write_count()
    }

    /// Places the workload for its next round the way the scheduler does.
    pub fn redispatch(&self) -> u32 {
        let mut workload = self.workload();
        let round = workload.mark_dispatched();
        self.store.insert(workload);
        round
    }
}
