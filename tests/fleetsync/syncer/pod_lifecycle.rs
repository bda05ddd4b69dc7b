use fleetsync::fleetsync::controller::delete::DeleteOptions;
use fleetsync::fleetsync::k8s::node::Node;
use fleetsync::fleetsync::k8s::pod::PodPhase;
use fleetsync::fleetsync::syncer::message::{ChangeMessage, GroupVersionKind, ResourceAction};
use fleetsync::fleetsync::test_support::{
    dispatched_application_workload, dispatched_job_workload, seconds_ago, PodFixture,
    SyncHarness, TEST_NAMESPACE,
};
use fleetsync::fleetsync::workload::types::{Workload, WorkloadSpec, LABEL_ADMIN_NODE};
use std::time::Duration;

fn pod_message(harness: &SyncHarness, name: &str) -> ChangeMessage {
    harness.message(GroupVersionKind::pod(), name, ResourceAction::Update)
}

#[tokio::test]
async fn scenario_terminating_pod_is_force_deleted_after_grace() {
    let harness = SyncHarness::new(dispatched_application_workload("wl-app", "Deployment", 1));
    let wl = harness.workload_id.clone();

    harness.gateway.put(
        PodFixture::new(TEST_NAMESPACE, "app-0", &wl)
            .phase("Running")
            .deleted_at(&seconds_ago(10))
            .build(),
    );
    let outcome = harness.deliver(&pod_message(&harness, "app-0")).await;
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(3)));
    assert!(harness.gateway.delete_calls().is_empty());

    harness.gateway.put(
        PodFixture::new(TEST_NAMESPACE, "app-0", &wl)
            .phase("Running")
            .deleted_at(&seconds_ago(25))
            .build(),
    );
    let outcome = harness.deliver(&pod_message(&harness, "app-0")).await;
    assert!(!outcome.is_requeue());
    let calls = harness.gateway.delete_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "app-0");
    assert_eq!(calls[0].namespace, TEST_NAMESPACE);
    assert_eq!(calls[0].options, DeleteOptions::force());
}

#[tokio::test]
async fn scenario_application_pod_records_follow_the_cluster() {
    let harness = SyncHarness::new(dispatched_application_workload("wl-app", "Deployment", 1));
    let wl = harness.workload_id.clone();
    harness
        .gateway
        .put_node(Node::named("k8s-a").with_label(LABEL_ADMIN_NODE, "admin-a"));
    harness.gateway.put(
        PodFixture::new(TEST_NAMESPACE, "app-0", &wl)
            .phase("Running")
            .on_node("k8s-a", "10.0.0.1")
            .started(&seconds_ago(30))
            .build(),
    );

    harness.deliver(&pod_message(&harness, "app-0")).await;
    let workload = harness.workload();
    let record = workload.status.pod("app-0").expect("record");
    assert_eq!(record.phase, PodPhase::Running);
    assert_eq!(record.admin_node_name, "admin-a");
    assert_eq!(record.host_ip, "10.0.0.1");
    assert_eq!(record.pod_ip, "172.16.0.1");

    let writes = harness.write_count();
    harness.deliver(&pod_message(&harness, "app-0")).await;
    assert_eq!(harness.write_count(), writes, "unchanged pod wrote");

    harness.gateway.remove("Pod", TEST_NAMESPACE, "app-0");
    harness.deliver(&pod_message(&harness, "app-0")).await;
    assert!(harness.workload().status.pod("app-0").is_none());
}

#[tokio::test]
async fn scenario_job_pod_records_survive_deletion() {
    let harness = SyncHarness::new(dispatched_job_workload("wl-job", 1, 0));
    let wl = harness.workload_id.clone();
    harness.gateway.put(
        PodFixture::new(TEST_NAMESPACE, "job-0", &wl)
            .phase("Running")
            .on_node("k8s-unlabelled", "10.0.0.9")
            .build(),
    );
    harness.deliver(&pod_message(&harness, "job-0")).await;
    let record = harness.workload().status.pod("job-0").cloned().expect("record");
    assert!(record.admin_node_name.is_empty());

    let delete = harness.message(GroupVersionKind::pod(), "job-0", ResourceAction::Delete);
    harness.deliver(&delete).await;
    assert!(harness.workload().status.pod("job-0").is_some());
}

#[tokio::test]
async fn scenario_undispatched_workload_defers_pods() {
    let harness = SyncHarness::new(Workload::new("wl-new", WorkloadSpec::new("Job", 1)));
    harness
        .gateway
        .put(PodFixture::new(TEST_NAMESPACE, "new-0", "wl-new").build());

    let outcome = harness.deliver(&pod_message(&harness, "new-0")).await;
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(1)));
    assert_eq!(harness.write_count(), 0);
}

#[tokio::test]
async fn scenario_ops_job_log_summary_lands_on_main_container() {
    let mut workload = dispatched_job_workload("wl-ops", 1, 0);
    workload.spec.ops_job = true;
    let harness = SyncHarness::new(workload);
    harness.gateway.put(
        PodFixture::new(TEST_NAMESPACE, "ops-0", "wl-ops")
            .phase("Failed")
            .on_node("k8s-a", "10.0.0.1")
            .terminated("main", 3, "Error", &seconds_ago(1))
            .build(),
    );
    harness.gateway.set_log(
        TEST_NAMESPACE,
        "ops-0",
        "main",
        "check disks\n[ERROR] sda unhealthy\n[SUCCESS] nic ok\ndone",
    );

    harness.deliver(&pod_message(&harness, "ops-0")).await;
    assert_eq!(harness.gateway.log_calls(), 1);
    let workload = harness.workload();
    let record = workload.status.pod("ops-0").expect("record");
    assert_eq!(record.containers.len(), 1);
    assert_eq!(
        record.containers[0].message,
        r#"["[ERROR] sda unhealthy","[SUCCESS] nic ok"]"#
    );
}

#[tokio::test]
async fn scenario_ops_job_without_markers_keeps_container_message() {
    let mut workload = dispatched_job_workload("wl-ops", 1, 0);
    workload.spec.ops_job = true;
    let harness = SyncHarness::new(workload);
    harness.gateway.put(
        PodFixture::new(TEST_NAMESPACE, "ops-0", "wl-ops")
            .phase("Succeeded")
            .terminated("main", 0, "Completed", &seconds_ago(1))
            .build(),
    );
    harness
        .gateway
        .set_log(TEST_NAMESPACE, "ops-0", "main", "all quiet");

    harness.deliver(&pod_message(&harness, "ops-0")).await;
    let workload = harness.workload();
    let record = workload.status.pod("ops-0").expect("record");
    assert_eq!(record.containers[0].message, "main exited with 0");
}

#[tokio::test]
async fn scenario_ops_log_summary_kept_on_pod_without_main_termination() {
    let mut workload = dispatched_job_workload("wl-ops", 1, 0);
    workload.spec.ops_job = true;
    let harness = SyncHarness::new(workload);
    let mut pod = PodFixture::new(TEST_NAMESPACE, "ops-0", "wl-ops")
        .phase("Failed")
        .build();
    pod["status"]["reason"] = serde_json::json!("Evicted");
    pod["status"]["message"] = serde_json::json!("node pressure");
    harness.gateway.put(pod);
    harness
        .gateway
        .set_log(TEST_NAMESPACE, "ops-0", "main", "scan\n[ERROR] disk full");

    harness.deliver(&pod_message(&harness, "ops-0")).await;
    let workload = harness.workload();
    let record = workload.status.pod("ops-0").expect("record");
    assert!(record.containers.is_empty());
    assert_eq!(
        record.failed_message,
        r#"Evicted: node pressure, log: ["[ERROR] disk full"]"#
    );
}

#[tokio::test]
async fn scenario_cancelled_log_fetch_is_transient() {
    let mut workload = dispatched_job_workload("wl-ops", 1, 0);
    workload.spec.ops_job = true;
    let harness = SyncHarness::new(workload);
    harness.gateway.put(
        PodFixture::new(TEST_NAMESPACE, "ops-0", "wl-ops")
            .phase("Failed")
            .terminated("main", 3, "Error", &seconds_ago(1))
            .build(),
    );
    harness.gateway.stall_logs();

    let message = pod_message(&harness, "ops-0");
    let ctx = harness.context();
    let fetch = harness.dispatcher.dispatch(ctx, &message);
    let cancel = async {
        tokio::task::yield_now().await;
        ctx.cancellation_token().cancel();
    };
    let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(fetch, cancel)
    })
    .await
    .expect("cancellation ends the log fetch");

    let err = result.expect_err("cancelled fetch is retried");
    assert!(!err.is_non_retryable());
    assert!(!err.is_unrecoverable());
    assert_eq!(err.class(), "transient");
    assert_eq!(harness.gateway.log_calls(), 1);
    assert_eq!(harness.write_count(), 0);
    assert!(harness.workload().status.pod("ops-0").is_none());
}

#[tokio::test]
async fn scenario_undecodable_pod_is_dropped() {
    let harness = SyncHarness::new(dispatched_job_workload("wl-bad", 1, 0));
    harness.gateway.put(serde_json::json!({
        "kind": "Pod",
        "metadata": {"name": "bad-0", "namespace": TEST_NAMESPACE, "labels": "oops"},
    }));
    let outcome = harness.deliver(&pod_message(&harness, "bad-0")).await;
    assert!(!outcome.is_requeue());
    assert_eq!(harness.write_count(), 0);
}
