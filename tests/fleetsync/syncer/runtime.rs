use fleetsync::fleetsync::config::SyncerConfig;
use fleetsync::fleetsync::syncer::error::{SyncError, SyncFuture};
use fleetsync::fleetsync::syncer::message::{ChangeMessage, GroupVersionKind, ResourceAction};
use fleetsync::fleetsync::syncer::Syncer;
use fleetsync::fleetsync::test_support::{
    dispatched_application_workload, FakeClusterGateway, PodFixture, TEST_CLUSTER,
    TEST_NAMESPACE,
};
use fleetsync::fleetsync::workload::types::Workload;
use fleetsync::fleetsync::workload::{InMemoryWorkloadStore, WorkloadStore};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn fast_config() -> SyncerConfig {
    SyncerConfig {
        workers: 2,
        not_ready_requeue: Duration::from_millis(20),
        error_backoff_initial: Duration::from_millis(10),
        error_backoff_max: Duration::from_millis(40),
        ..SyncerConfig::default()
    }
}

fn pod_message(workload_id: &str, pod: &str) -> ChangeMessage {
    ChangeMessage::new(
        TEST_CLUSTER,
        GroupVersionKind::pod(),
        TEST_NAMESPACE,
        pod,
        workload_id,
        ResourceAction::Add,
    )
    .with_dispatch_count(1)
}

async fn wait_for<F>(what: &str, mut done: F)
where
    F: FnMut() -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !done() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Loses the first status write to a concurrent writer that touches an
/// annotation, the way a second controller would.
struct RacingStore {
    inner: Arc<InMemoryWorkloadStore>,
    conflicts: AtomicUsize,
}

impl RacingStore {
    fn new(inner: Arc<InMemoryWorkloadStore>) -> Self {
        Self {
            inner,
            conflicts: AtomicUsize::new(0),
        }
    }
}

impl WorkloadStore for RacingStore {
    fn get<'a>(&'a self, id: &'a str) -> SyncFuture<'a, Workload> {
        self.inner.get(id)
    }

    fn update_status<'a>(&'a self, workload: &'a Workload) -> SyncFuture<'a, Workload> {
        if self.conflicts.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(mut current) = self.inner.snapshot(&workload.id) {
                current
                    .annotations
                    .insert("fleetsync.io/touched".to_string(), String::new());
                self.inner.insert(current);
            }
            let err = SyncError::conflict(format!("workload {} moved on", workload.id));
            return Box::pin(async move { Err(err) });
        }
        self.inner.update_status(workload)
    }

    fn update<'a>(&'a self, workload: &'a Workload) -> SyncFuture<'a, Workload> {
        self.inner.update(workload)
    }

    fn patch_annotations<'a>(
        &'a self,
        id: &'a str,
        patch: BTreeMap<String, Option<String>>,
    ) -> SyncFuture<'a, Workload> {
        self.inner.patch_annotations(id, patch)
    }
}

#[tokio::test]
async fn scenario_store_conflict_rereads_and_converges() {
    let inner = Arc::new(InMemoryWorkloadStore::new());
    inner.insert(dispatched_application_workload("wl-d", "Deployment", 1));
    let store = Arc::new(RacingStore::new(inner.clone()));
    let gateway = Arc::new(FakeClusterGateway::new());
    gateway.put(
        PodFixture::new(TEST_NAMESPACE, "svc-0", "wl-d")
            .phase("Running")
            .build(),
    );

    let syncer = Syncer::new(fast_config(), store.clone());
    syncer.register_cluster(TEST_CLUSTER, gateway.clone());
    syncer.start();
    syncer.enqueue(pod_message("wl-d", "svc-0")).await.expect("enqueue");

    wait_for("pod record after conflict", || {
        inner
            .snapshot("wl-d")
            .is_some_and(|workload| workload.status.pod("svc-0").is_some())
    })
    .await;
    let workload = inner.snapshot("wl-d").expect("workload");
    assert!(workload.annotations.contains_key("fleetsync.io/touched"));
    assert_eq!(store.conflicts.load(Ordering::SeqCst), 2);
    assert_eq!(gateway.get_calls(), 2);
    assert_eq!(inner.write_count(), 1);

    syncer.enqueue(pod_message("wl-d", "svc-0")).await.expect("enqueue");
    wait_for("duplicate delivery", || gateway.get_calls() == 3).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(inner.write_count(), 1);
    syncer.shutdown().await;
}

#[tokio::test]
async fn scenario_workers_reconcile_queued_messages() {
    let store = Arc::new(InMemoryWorkloadStore::new());
    store.insert(dispatched_application_workload("wl-a", "Deployment", 2));
    let gateway = Arc::new(FakeClusterGateway::new());
    for pod in ["web-0", "web-1"] {
        gateway.put(
            PodFixture::new(TEST_NAMESPACE, pod, "wl-a")
                .phase("Running")
                .build(),
        );
    }

    let syncer = Syncer::new(fast_config(), store.clone());
    syncer.registry().add(TEST_CLUSTER, gateway);
    syncer.start();
    syncer.enqueue(pod_message("wl-a", "web-0")).await.expect("enqueue");
    syncer.enqueue(pod_message("wl-a", "web-1")).await.expect("enqueue");

    wait_for("both pod records", || {
        store
            .snapshot("wl-a")
            .is_some_and(|workload| workload.status.pods.len() == 2)
    })
    .await;
    timeout(Duration::from_secs(5), syncer.shutdown())
        .await
        .expect("shutdown completes");
}

#[tokio::test]
async fn scenario_message_for_unknown_cluster_waits_for_registration() {
    let store = Arc::new(InMemoryWorkloadStore::new());
    store.insert(dispatched_application_workload("wl-b", "StatefulSet", 1));
    let syncer = Syncer::new(fast_config(), store.clone());
    syncer.start();
    syncer.enqueue(pod_message("wl-b", "db-0")).await.expect("enqueue");

    sleep(Duration::from_millis(60)).await;
    assert!(store.snapshot("wl-b").expect("workload").status.pods.is_empty());

    let gateway = Arc::new(FakeClusterGateway::new());
    gateway.put(
        PodFixture::new(TEST_NAMESPACE, "db-0", "wl-b")
            .phase("Running")
            .build(),
    );
    syncer.register_cluster(TEST_CLUSTER, gateway);

    wait_for("pod record after registration", || {
        store
            .snapshot("wl-b")
            .is_some_and(|workload| workload.status.pod("db-0").is_some())
    })
    .await;
    assert!(syncer.remove_cluster(TEST_CLUSTER));
    assert!(!syncer.remove_cluster(TEST_CLUSTER));
    syncer.shutdown().await;
}

#[tokio::test]
async fn scenario_transient_failures_are_retried() {
    let store = Arc::new(InMemoryWorkloadStore::new());
    store.insert(dispatched_application_workload("wl-c", "Deployment", 1));
    let gateway = Arc::new(FakeClusterGateway::new());
    gateway.put(
        PodFixture::new(TEST_NAMESPACE, "api-0", "wl-c")
            .phase("Running")
            .build(),
    );
    gateway.fail_next_get("connection reset");
    gateway.fail_next_get("connection reset");

    let syncer = Syncer::new(fast_config(), store.clone());
    syncer.registry().add(TEST_CLUSTER, gateway.clone());
    syncer.start();
    syncer.enqueue(pod_message("wl-c", "api-0")).await.expect("enqueue");

    wait_for("pod record after retries", || {
        store
            .snapshot("wl-c")
            .is_some_and(|workload| workload.status.pod("api-0").is_some())
    })
    .await;
    assert_eq!(gateway.get_calls(), 3);
    syncer.shutdown().await;
}

#[test]
fn backoff_grows_and_caps() {
    let config = fast_config();
    assert_eq!(config.error_backoff(0), Duration::from_millis(10));
    assert_eq!(config.error_backoff(1), Duration::from_millis(20));
    assert_eq!(config.error_backoff(5), Duration::from_millis(40));
}
