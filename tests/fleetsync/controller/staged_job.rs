use chrono::{Duration as ChronoDuration, Utc};
use fleetsync::fleetsync::config::SyncerConfig;
use fleetsync::fleetsync::controller::job::{
    ManagedJob, ManagedJobPhase, WorkloadJobController, CONDITION_JOB_COMPLETED,
};
use fleetsync::fleetsync::controller::reconcile::{
    ClearHook, ReconcileContext, StagedDriver, REASON_JOB_FAILED, REASON_JOB_STOPPED,
    REASON_JOB_SUCCEEDED, REASON_JOB_TIMEOUT,
};
use fleetsync::fleetsync::controller::store::InMemoryObjectStore;
use fleetsync::fleetsync::syncer::error::{SyncError, SyncFuture};
use fleetsync::fleetsync::workload::types::{
    dispatch_reason, Condition, ConditionType, Workload, WorkloadPhase, WorkloadSpec,
};
use fleetsync::fleetsync::workload::InMemoryWorkloadStore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CONTROLLER: &str = "fleet-a";

struct Harness {
    workloads: Arc<InMemoryWorkloadStore>,
    jobs: Arc<InMemoryObjectStore<ManagedJob>>,
    driver: StagedDriver<WorkloadJobController>,
    ctx: ReconcileContext,
}

impl Harness {
    fn new() -> Self {
        Self::with_hook(None)
    }

    fn with_hook(hook: Option<Arc<FlakyHook>>) -> Self {
        let workloads = Arc::new(InMemoryWorkloadStore::new());
        let jobs = Arc::new(InMemoryObjectStore::<ManagedJob>::new());
        let controller = Arc::new(WorkloadJobController::new(
            CONTROLLER,
            workloads.clone(),
            jobs.clone(),
        ));
        let mut driver = StagedDriver::new(controller, jobs.clone());
        if let Some(hook) = hook {
            driver = driver.with_clear_hook(hook);
        }
        Self {
            workloads,
            jobs,
            driver,
            ctx: ReconcileContext::new(Arc::new(SyncerConfig::default())),
        }
    }

    fn set_workload_phase(&self, id: &str, phase: WorkloadPhase, message: &str) {
        let mut workload = self
            .workloads
            .snapshot(id)
            .unwrap_or_else(|| Workload::new(id, WorkloadSpec::new("Job", 1)));
        workload.status.phase = Some(phase);
        if !message.is_empty() {
            workload.status.conditions.push(Condition::new(
                ConditionType::K8sSucceeded,
                message,
                dispatch_reason(1),
                Utc::now(),
            ));
        }
        self.workloads.insert(workload);
    }

    fn job(&self, name: &str) -> Option<ManagedJob> {
        self.jobs.snapshot(name)
    }
}

#[derive(Default)]
struct FlakyHook {
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl ClearHook<ManagedJob> for FlakyHook {
    fn clear<'a>(
        &'a self,
        _ctx: &'a ReconcileContext,
        _job: &'a ManagedJob,
    ) -> SyncFuture<'a, ()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail.load(Ordering::SeqCst) {
            Err(SyncError::transient("cleanup endpoint unavailable"))
        } else {
            Ok(())
        };
        Box::pin(async move { result })
    }
}

#[tokio::test]
async fn scenario_job_mirrors_workload_until_success() {
    let harness = Harness::new();
    harness.set_workload_phase("wl-1", WorkloadPhase::Pending, "");
    harness.jobs.insert(ManagedJob::new("job-1", "wl-1", CONTROLLER));

    let outcome = harness
        .driver
        .reconcile(&harness.ctx, "job-1")
        .await
        .expect("pending pass");
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(1)));
    assert_eq!(
        harness.job("job-1").and_then(|job| job.phase()),
        Some(ManagedJobPhase::Pending)
    );

    harness.set_workload_phase("wl-1", WorkloadPhase::Running, "");
    let outcome = harness
        .driver
        .reconcile(&harness.ctx, "job-1")
        .await
        .expect("running pass");
    assert!(!outcome.is_requeue());
    let job = harness.job("job-1").expect("job");
    assert_eq!(job.phase(), Some(ManagedJobPhase::Running));
    assert!(job.status.started_at.is_some());

    harness.set_workload_phase(
        "wl-1",
        WorkloadPhase::Succeeded,
        "Job is successfully completed",
    );
    harness
        .driver
        .reconcile(&harness.ctx, "job-1")
        .await
        .expect("success pass");
    let job = harness.job("job-1").expect("job");
    assert_eq!(job.phase(), Some(ManagedJobPhase::Succeeded));
    assert!(job.status.finished_at.is_some());
    assert_eq!(job.status.conditions.len(), 1);
    let condition = &job.status.conditions[0];
    assert_eq!(condition.condition_type, CONDITION_JOB_COMPLETED);
    assert_eq!(condition.reason, REASON_JOB_SUCCEEDED);
    assert_eq!(condition.message, "Job is successfully completed");

    let version = job.resource_version;
    harness
        .driver
        .reconcile(&harness.ctx, "job-1")
        .await
        .expect("finished pass");
    assert_eq!(harness.job("job-1").expect("job").resource_version, version);
}

#[tokio::test]
async fn scenario_job_times_out() {
    let harness = Harness::new();
    harness.set_workload_phase("wl-2", WorkloadPhase::Running, "");
    let mut job = ManagedJob::new("job-2", "wl-2", CONTROLLER).with_timeout(60);
    job.creation_timestamp = Utc::now() - ChronoDuration::seconds(120);
    harness.jobs.insert(job);

    harness
        .driver
        .reconcile(&harness.ctx, "job-2")
        .await
        .expect("timeout pass");
    let job = harness.job("job-2").expect("job");
    assert_eq!(job.phase(), Some(ManagedJobPhase::Failed));
    assert_eq!(job.status.conditions[0].reason, REASON_JOB_TIMEOUT);
    assert_eq!(job.status.message, "The job is timeout, timeoutSecond: 60");
}

#[tokio::test]
async fn scenario_running_job_with_deadline_is_revisited() {
    let harness = Harness::new();
    harness.set_workload_phase("wl-6", WorkloadPhase::Running, "");
    let mut job = ManagedJob::new("job-6", "wl-6", CONTROLLER).with_timeout(60);
    job.creation_timestamp = Utc::now() - ChronoDuration::seconds(30);
    harness.jobs.insert(job);

    let outcome = harness
        .driver
        .reconcile(&harness.ctx, "job-6")
        .await
        .expect("running pass");
    let delay = outcome.requeue_after.expect("deadline requeue");
    assert!(delay > Duration::from_secs(25), "delay {delay:?}");
    assert!(delay <= Duration::from_secs(30), "delay {delay:?}");
    assert_eq!(
        harness.job("job-6").and_then(|job| job.phase()),
        Some(ManagedJobPhase::Running)
    );

    let mut job = harness.job("job-6").expect("job");
    job.creation_timestamp = Utc::now() - ChronoDuration::seconds(61);
    harness.jobs.insert(job);
    let outcome = harness
        .driver
        .reconcile(&harness.ctx, "job-6")
        .await
        .expect("deadline pass");
    assert!(!outcome.is_requeue());
    let job = harness.job("job-6").expect("job");
    assert_eq!(job.phase(), Some(ManagedJobPhase::Failed));
    assert_eq!(job.status.conditions[0].reason, REASON_JOB_TIMEOUT);
}

#[tokio::test]
async fn scenario_missing_workload_fails_the_job() {
    let harness = Harness::new();
    harness.jobs.insert(ManagedJob::new("job-3", "wl-gone", CONTROLLER));

    let outcome = harness
        .driver
        .reconcile(&harness.ctx, "job-3")
        .await
        .expect("handled");
    assert!(!outcome.is_requeue());
    let job = harness.job("job-3").expect("job");
    assert_eq!(job.phase(), Some(ManagedJobPhase::Failed));
    assert_eq!(job.status.conditions[0].reason, REASON_JOB_FAILED);
    assert_eq!(job.status.message, "workload wl-gone not found");
}

#[tokio::test]
async fn scenario_foreign_jobs_are_ignored() {
    let harness = Harness::new();
    harness.set_workload_phase("wl-4", WorkloadPhase::Running, "");
    let stored = harness
        .jobs
        .insert(ManagedJob::new("job-4", "wl-4", "fleet-b"));

    harness
        .driver
        .reconcile(&harness.ctx, "job-4")
        .await
        .expect("filtered pass");
    assert_eq!(harness.job("job-4"), Some(stored));
}

#[tokio::test]
async fn scenario_failed_cleanup_keeps_the_finalizer() {
    let hook = Arc::new(FlakyHook::default());
    hook.fail.store(true, Ordering::SeqCst);
    let harness = Harness::with_hook(Some(hook.clone()));
    harness.set_workload_phase("wl-5", WorkloadPhase::Running, "");
    let mut job = ManagedJob::new("job-5", "wl-5", CONTROLLER);
    job.deletion_timestamp = Some(Utc::now());
    harness.jobs.insert(job);

    let err = harness
        .driver
        .reconcile(&harness.ctx, "job-5")
        .await
        .expect_err("cleanup failure surfaces");
    assert!(!err.is_non_retryable());
    let job = harness.job("job-5").expect("job kept");
    assert!(job.finalizers.iter().any(|f| f == "fleetsync.io/job-finalizer"));
    assert_eq!(job.phase(), Some(ManagedJobPhase::Failed));
    assert_eq!(job.status.conditions[0].reason, REASON_JOB_STOPPED);

    hook.fail.store(false, Ordering::SeqCst);
    harness
        .driver
        .reconcile(&harness.ctx, "job-5")
        .await
        .expect("cleanup succeeds");
    assert!(harness.job("job-5").is_none());
    assert_eq!(hook.calls.load(Ordering::SeqCst), 2);
}
