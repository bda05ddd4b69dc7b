use fleetsync::fleetsync::k8s::node::Node;
use fleetsync::fleetsync::syncer::message::{GroupVersionKind, ResourceAction};
use fleetsync::fleetsync::test_support::{
    batch_job, dispatched_application_workload, dispatched_job_workload, seconds_ago,
    PodFixture, SyncHarness, TEST_NAMESPACE,
};
use fleetsync::fleetsync::workload::types::{
    ConditionType, WorkloadPhase, ANNOTATION_RESCHEDULED, ANNOTATION_STOPPING, LABEL_ADMIN_NODE,
};
use serde_json::json;
use std::time::Duration;

const JOB_NAME: &str = "train";

fn failed_job_status(message: &str) -> serde_json::Value {
    json!({
        "conditions": [{
            "type": "Failed",
            "status": "True",
            "reason": "BackoffLimitExceeded",
            "message": message,
        }]
    })
}

async fn deliver_pod(harness: &SyncHarness, fixture: PodFixture) {
    let object = fixture.build();
    let name = object["metadata"]["name"]
        .as_str()
        .expect("fixture name")
        .to_string();
    harness.gateway.put(object);
    let message = harness.message(GroupVersionKind::pod(), &name, ResourceAction::Update);
    harness.deliver(&message).await;
}

#[tokio::test]
async fn scenario_job_fails_over_once_then_fails() {
    let harness = SyncHarness::new(dispatched_job_workload("wl-train", 2, 1));
    let wl = harness.workload_id.clone();
    harness
        .gateway
        .put_node(Node::named("k8s-a").with_label(LABEL_ADMIN_NODE, "admin-a"));
    harness
        .gateway
        .put_node(Node::named("k8s-b").with_label(LABEL_ADMIN_NODE, "admin-b"));

    // Running before every pod was observed: wait, do not write.
    harness
        .gateway
        .put(batch_job(TEST_NAMESPACE, JOB_NAME, json!({"active": 2})));
    let job_round_one = harness.message(GroupVersionKind::job(), JOB_NAME, ResourceAction::Update);
    let outcome = harness.deliver(&job_round_one).await;
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(1)));
    assert_eq!(harness.write_count(), 0);

    let started = seconds_ago(60);
    deliver_pod(
        &harness,
        PodFixture::new(TEST_NAMESPACE, "train-0", &wl)
            .phase("Running")
            .on_node("k8s-b", "10.0.0.2")
            .started(&started)
            .rank("0"),
    )
    .await;
    deliver_pod(
        &harness,
        PodFixture::new(TEST_NAMESPACE, "train-1", &wl)
            .phase("Running")
            .on_node("k8s-a", "10.0.0.1")
            .started(&started)
            .rank("1"),
    )
    .await;
    let workload = harness.workload();
    let record = workload.status.pod("train-0").expect("train-0 recorded");
    assert_eq!(record.admin_node_name, "admin-b");
    assert_eq!(record.rank, "0");

    harness.deliver(&job_round_one).await;
    let workload = harness.workload();
    assert_eq!(workload.phase(), Some(WorkloadPhase::Running));
    assert_eq!(workload.status.nodes, vec![vec!["k8s-a", "k8s-b"]]);
    assert!(workload.status.start_time.is_some());
    let running = workload.status.conditions.last().expect("condition");
    assert_eq!(running.condition_type, ConditionType::K8sRunning);
    assert_eq!(running.reason, "Dispatch-1");

    let writes = harness.write_count();
    harness.deliver(&job_round_one).await;
    assert_eq!(harness.write_count(), writes, "repeat observation wrote");

    deliver_pod(
        &harness,
        PodFixture::new(TEST_NAMESPACE, "train-1", &wl)
            .phase("Failed")
            .on_node("k8s-a", "10.0.0.1")
            .started(&started)
            .terminated("main", 1, "Error", &seconds_ago(5)),
    )
    .await;
    harness.gateway.put(batch_job(
        TEST_NAMESPACE,
        JOB_NAME,
        failed_job_status("Job has reached the specified backoff limit"),
    ));
    harness.deliver(&job_round_one).await;

    let workload = harness.workload();
    assert_eq!(workload.phase(), Some(WorkloadPhase::Pending));
    assert!(workload.status.pods.is_empty());
    assert!(!workload.is_dispatched());
    assert!(workload.annotations.contains_key(ANNOTATION_RESCHEDULED));
    assert_eq!(workload.status.nodes.len(), 2);
    assert!(workload.status.nodes[1].is_empty());
    let failed = workload
        .status
        .conditions
        .iter()
        .find(|c| c.condition_type == ConditionType::K8sFailed)
        .expect("failure condition");
    assert_eq!(
        failed.message,
        r#"Job has reached the specified backoff limit, details: [{"container":"main","node":"k8s-a","pod":"train-1"}]"#
    );
    let scheduling = workload.status.conditions.last().expect("condition");
    assert_eq!(scheduling.condition_type, ConditionType::AdminScheduling);
    assert_eq!(scheduling.reason, "Dispatch-2");

    // Waiting for the scheduler.
    let outcome = harness.deliver(&job_round_one).await;
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(1)));

    assert_eq!(harness.redispatch(), 2);
    let writes = harness.write_count();
    harness.deliver(&job_round_one).await;
    assert_eq!(harness.write_count(), writes, "stale round wrote");

    for name in ["train-r2-0", "train-r2-1"] {
        deliver_pod(
            &harness,
            PodFixture::new(TEST_NAMESPACE, name, &wl)
                .phase("Failed")
                .on_node("k8s-a", "10.0.0.1")
                .started(&started)
                .terminated("main", 2, "Error", &seconds_ago(1)),
        )
        .await;
    }
    let job_round_two = harness.message(GroupVersionKind::job(), JOB_NAME, ResourceAction::Update);
    harness.deliver(&job_round_two).await;

    let workload = harness.workload();
    assert_eq!(workload.phase(), Some(WorkloadPhase::Failed));
    assert!(workload.status.end_time.is_some());
    assert_eq!(
        workload.status.nodes,
        vec![vec!["k8s-a", "k8s-b"], vec!["k8s-a"]]
    );
    let last = workload.status.conditions.last().expect("condition");
    assert_eq!(last.condition_type, ConditionType::K8sFailed);
    assert_eq!(last.reason, "Dispatch-2");

    let writes = harness.write_count();
    harness
        .gateway
        .put(batch_job(TEST_NAMESPACE, JOB_NAME, json!({"active": 2})));
    harness.deliver(&job_round_two).await;
    assert_eq!(harness.write_count(), writes, "ended workload changed");
    assert_eq!(harness.workload().phase(), Some(WorkloadPhase::Failed));
}

#[tokio::test]
async fn scenario_succeeded_job_is_final() {
    let harness = SyncHarness::new(dispatched_job_workload("wl-ok", 1, 3));
    let wl = harness.workload_id.clone();
    deliver_pod(
        &harness,
        PodFixture::new(TEST_NAMESPACE, "ok-0", &wl)
            .phase("Succeeded")
            .on_node("k8s-a", "10.0.0.1")
            .terminated("main", 0, "Completed", &seconds_ago(2)),
    )
    .await;
    harness.gateway.put(batch_job(
        TEST_NAMESPACE,
        "ok",
        json!({"succeeded": 1, "conditions": [{"type": "Complete", "status": "True"}]}),
    ));
    let message = harness.message(GroupVersionKind::job(), "ok", ResourceAction::Update);
    harness.deliver(&message).await;

    let workload = harness.workload();
    assert_eq!(workload.phase(), Some(WorkloadPhase::Succeeded));
    assert!(workload.status.end_time.is_some());
    assert_eq!(workload.status.nodes, vec![vec!["k8s-a"]]);
    let last = workload.status.conditions.last().expect("condition");
    assert_eq!(last.condition_type, ConditionType::K8sSucceeded);
    assert_eq!(last.message, "Job is successfully completed");
}

#[tokio::test]
async fn scenario_job_delete_waits_for_pods_to_drain() {
    let harness = SyncHarness::new(dispatched_job_workload("wl-del", 1, 0));
    let wl = harness.workload_id.clone();
    harness.gateway.put(
        PodFixture::new(TEST_NAMESPACE, "del-0", &wl)
            .phase("Running")
            .build(),
    );
    let delete = harness.message(GroupVersionKind::job(), "del", ResourceAction::Delete);

    let outcome = harness.deliver(&delete).await;
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(3)));
    assert_eq!(harness.write_count(), 0);

    harness.gateway.remove("Pod", TEST_NAMESPACE, "del-0");
    let outcome = harness.deliver(&delete).await;
    assert!(!outcome.is_requeue());
    let workload = harness.workload();
    assert_eq!(workload.phase(), Some(WorkloadPhase::Failed));
    let last = workload.status.conditions.last().expect("condition");
    assert_eq!(last.condition_type, ConditionType::K8sDeleted);
    assert_eq!(last.message, "Job del is deleted");
}

#[tokio::test]
async fn scenario_stopping_job_is_stopped_on_delete() {
    let mut workload = dispatched_job_workload("wl-stop", 1, 5);
    workload.status.phase = Some(WorkloadPhase::Running);
    workload
        .annotations
        .insert(ANNOTATION_STOPPING.to_string(), String::new());
    let harness = SyncHarness::new(workload);

    let delete = harness.message(GroupVersionKind::job(), "stop", ResourceAction::Delete);
    harness.deliver(&delete).await;
    let workload = harness.workload();
    assert_eq!(workload.phase(), Some(WorkloadPhase::Stopped));
    assert!(workload.status.end_time.is_some());
    assert!(!workload.annotations.contains_key(ANNOTATION_RESCHEDULED));
}

#[tokio::test]
async fn scenario_deleted_statefulset_is_rescheduled() {
    let mut workload = dispatched_application_workload("wl-svc", "StatefulSet", 1);
    workload.status.phase = Some(WorkloadPhase::Running);
    let harness = SyncHarness::new(workload);

    let delete = harness.message(
        GroupVersionKind::statefulset(),
        "svc",
        ResourceAction::Delete,
    );
    harness.deliver(&delete).await;
    let workload = harness.workload();
    assert_eq!(workload.phase(), Some(WorkloadPhase::Pending));
    assert!(workload.annotations.contains_key(ANNOTATION_RESCHEDULED));
    assert_eq!(workload.status.nodes.len(), 2);
}

#[tokio::test]
async fn scenario_statefulset_rollout_is_updating() {
    let mut workload = dispatched_application_workload("wl-roll", "StatefulSet", 1);
    workload.status.phase = Some(WorkloadPhase::Running);
    let harness = SyncHarness::new(workload);
    harness.gateway.put(json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {"name": "roll", "namespace": TEST_NAMESPACE},
        "spec": {"replicas": 1, "selector": {"matchLabels": {"app": "roll"}}},
        "status": {"currentRevision": "roll-1", "updateRevision": "roll-2", "readyReplicas": 1},
    }));

    let message = harness.message(
        GroupVersionKind::statefulset(),
        "roll",
        ResourceAction::Update,
    );
    harness.deliver(&message).await;
    let workload = harness.workload();
    assert_eq!(workload.phase(), Some(WorkloadPhase::Updating));
    let last = workload.status.conditions.last().expect("condition");
    assert_eq!(last.condition_type, ConditionType::K8sUpdating);
}
