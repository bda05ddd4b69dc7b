use fleetsync::fleetsync::syncer::message::{ChangeMessage, GroupVersionKind, ResourceAction};
use fleetsync::fleetsync::test_support::{
    dispatched_job_workload, event_object, SyncHarness, TEST_NAMESPACE,
};
use fleetsync::fleetsync::workload::types::WorkloadPhase;

fn publish(
    harness: &SyncHarness,
    name: &str,
    event_type: &str,
    reason: &str,
    message: &str,
) -> ChangeMessage {
    harness.gateway.put(event_object(
        TEST_NAMESPACE,
        name,
        "Pod",
        event_type,
        reason,
        message,
    ));
    harness.message(GroupVersionKind::event(), name, ResourceAction::Add)
}

#[tokio::test]
async fn scenario_pending_message_tracks_image_pulls() {
    let harness = SyncHarness::new(dispatched_job_workload("wl-pull", 1, 0));

    let pulling = publish(
        &harness,
        "ev-1",
        "Normal",
        "Pulling",
        "Pulling image \"registry/train:v2\"",
    );
    harness.deliver(&pulling).await;
    assert_eq!(
        harness.workload().status.message,
        "Pulling image \"registry/train:v2\""
    );

    let writes = harness.write_count();
    harness.deliver(&pulling).await;
    assert_eq!(harness.write_count(), writes, "duplicate event wrote");

    let pulled = publish(
        &harness,
        "ev-2",
        "Normal",
        "Pulled",
        "Successfully pulled image \"registry/train:v2\"",
    );
    harness.deliver(&pulled).await;
    assert_eq!(harness.workload().status.message, "");

    // Nothing left to clear.
    let writes = harness.write_count();
    harness.deliver(&pulled).await;
    assert_eq!(harness.write_count(), writes);
}

#[tokio::test]
async fn scenario_warnings_surface_unless_suppressed() {
    let harness = SyncHarness::new(dispatched_job_workload("wl-warn", 1, 0));

    let exists = publish(
        &harness,
        "ev-1",
        "Warning",
        "Failed",
        "Error: container name \"main\" already exists",
    );
    harness.deliver(&exists).await;
    assert_eq!(harness.write_count(), 0);

    let unhealthy = publish(&harness, "ev-2", "Warning", "Unhealthy", "probe failed");
    harness.deliver(&unhealthy).await;
    assert_eq!(harness.write_count(), 0);

    let mount = publish(
        &harness,
        "ev-3",
        "Warning",
        "FailedMount",
        "MountVolume.SetUp failed for volume \"data\"",
    );
    harness.deliver(&mount).await;
    assert_eq!(
        harness.workload().status.message,
        "MountVolume.SetUp failed for volume \"data\""
    );
}

#[tokio::test]
async fn scenario_events_ignored_once_running() {
    let mut workload = dispatched_job_workload("wl-run", 1, 0);
    workload.status.phase = Some(WorkloadPhase::Running);
    let harness = SyncHarness::new(workload);

    let backoff = publish(&harness, "ev-1", "Warning", "BackOff", "Back-off restarting");
    harness.deliver(&backoff).await;
    assert_eq!(harness.write_count(), 0);
    assert!(harness.workload().status.message.is_empty());
}

#[tokio::test]
async fn scenario_events_for_other_objects_are_ignored() {
    let harness = SyncHarness::new(dispatched_job_workload("wl-other", 1, 0));
    harness.gateway.put(event_object(
        TEST_NAMESPACE,
        "ev-1",
        "Job",
        "Warning",
        "BackoffLimitExceeded",
        "Job has reached the specified backoff limit",
    ));
    let message = harness.message(GroupVersionKind::event(), "ev-1", ResourceAction::Add);
    harness.deliver(&message).await;
    assert_eq!(harness.write_count(), 0);
}
