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

use crate::fleetsync::config::SyncerConfig;
use crate::fleetsync::controller::store::ObjectStore;
use crate::fleetsync::logger::{log_info, log_warn};
use crate::fleetsync::observability::metrics::{self, StagedResult};
use crate::fleetsync::syncer::error::{SyncError, SyncFuture};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const REASON_JOB_SUCCEEDED: &str = "JobSucceeded";
pub const REASON_JOB_FAILED: &str = "JobFailed";
pub const REASON_JOB_TIMEOUT: &str = "JobTimeout";
pub const REASON_JOB_STOPPED: &str = "JobStopped";

/// Per-invocation context handed to every handler.
///
/// Carries the resolved configuration and a cancellation token; long
/// running calls (log fetches) stop when the token fires.
#[derive(Clone)]
pub struct ReconcileContext {
    cancel: CancellationToken,
    config: Arc<SyncerConfig>,
}

impl ReconcileContext {
    pub fn new(config: Arc<SyncerConfig>) -> Self {
        Self::with_token(CancellationToken::new(), config)
    }

    pub fn with_token(cancel: CancellationToken, config: Arc<SyncerConfig>) -> Self {
        Self { cancel, config }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn config(&self) -> &SyncerConfig {
        &self.config
    }
}

/// Result of one handler pass. `requeue_after` asks the queue to deliver
/// the same message again once the delay elapses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    pub fn is_requeue(&self) -> bool {
        self.requeue_after.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPhase {
    Succeeded,
    Failed,
}

/// Terminal outcome recorded on a staged object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub phase: CompletionPhase,
    pub reason: String,
    pub message: String,
}

impl Completion {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            phase: CompletionPhase::Succeeded,
            reason: REASON_JOB_SUCCEEDED.to_string(),
            message: message.into(),
        }
    }

    pub fn failed(reason: &str, message: impl Into<String>) -> Self {
        Self {
            phase: CompletionPhase::Failed,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Bounded-lifetime object driven by [`StagedDriver`].
pub trait StagedObject: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;

    fn resource_version(&self) -> u64;

    fn set_resource_version(&mut self, version: u64);

    fn is_finished(&self) -> bool;

    fn is_deleting(&self) -> bool;

    fn has_finalizer(&self) -> bool;

    /// Drops this controller's finalizer; returns whether one was present.
    fn remove_finalizer(&mut self) -> bool;

    fn created_at(&self) -> Option<DateTime<Utc>>;

    /// Deadline in seconds after creation; zero disables the deadline.
    fn timeout_second(&self) -> u64;

    /// Records a terminal outcome. Must be a no-op returning `false` when
    /// the object already finished.
    fn complete(&mut self, completion: &Completion, now: DateTime<Utc>) -> bool;

    fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        let timeout = self.timeout_second();
        if timeout == 0 {
            return false;
        }
        match self.created_at() {
            Some(created) => {
                let timeout = i64::try_from(timeout).unwrap_or(i64::MAX);
                created + ChronoDuration::seconds(timeout) <= now
            }
            None => false,
        }
    }

    /// Time left until the deadline passes; `None` when no deadline applies.
    fn deadline_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let timeout = self.timeout_second();
        if timeout == 0 {
            return None;
        }
        let created = self.created_at()?;
        let timeout = i64::try_from(timeout).unwrap_or(i64::MAX);
        let left = created + ChronoDuration::seconds(timeout) - now;
        Some(left.to_std().unwrap_or(Duration::ZERO))
    }
}

/// Controller plugged into the staged driver. Only `handle` is required.
pub trait StagedReconciler: Send + Sync {
    type Object: StagedObject;

    /// Controller name used for logs and metrics.
    fn name(&self) -> &'static str;

    /// Returns `true` when the object is not ours and must be ignored.
    fn filter(&self, _object: &Self::Object) -> bool {
        false
    }

    /// Pre-check; `Ok(true)` stops the pass unless the object timed out.
    fn observe<'a>(
        &'a self,
        _ctx: &'a ReconcileContext,
        _object: &'a Self::Object,
    ) -> SyncFuture<'a, bool> {
        Box::pin(async { Ok(false) })
    }

    /// Invoked once the deadline passed, before the object is failed.
    fn timeout<'a>(
        &'a self,
        _ctx: &'a ReconcileContext,
        _object: &'a Self::Object,
    ) -> SyncFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a ReconcileContext,
        object: &'a Self::Object,
    ) -> SyncFuture<'a, ReconcileOutcome>;

    /// First cleanup step run during finalized deletion.
    fn clear<'a>(
        &'a self,
        _ctx: &'a ReconcileContext,
        _object: &'a Self::Object,
    ) -> SyncFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Additional cleanup step run after [`StagedReconciler::clear`].
pub trait ClearHook<O>: Send + Sync {
    fn clear<'a>(&'a self, ctx: &'a ReconcileContext, object: &'a O) -> SyncFuture<'a, ()>;
}

/// Runs the filter, deletion, observe, timeout and handle stages in order.
pub struct StagedDriver<R: StagedReconciler> {
    reconciler: Arc<R>,
    store: Arc<dyn ObjectStore<R::Object>>,
    clear_hooks: Vec<Arc<dyn ClearHook<R::Object>>>,
}

enum Stage {
    Skipped,
    Completed,
    Handled(ReconcileOutcome),
}

impl<R: StagedReconciler> StagedDriver<R> {
    pub fn new(reconciler: Arc<R>, store: Arc<dyn ObjectStore<R::Object>>) -> Self {
        Self {
            reconciler,
            store,
            clear_hooks: Vec::new(),
        }
    }

    pub fn with_clear_hook(mut self, hook: Arc<dyn ClearHook<R::Object>>) -> Self {
        self.clear_hooks.push(hook);
        self
    }

    pub async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        name: &str,
    ) -> Result<ReconcileOutcome, SyncError> {
        let controller = self.reconciler.name();
        match self.run(ctx, name).await {
            Ok(Stage::Skipped) => {
                metrics::record_staged_reconcile(controller, StagedResult::Skipped);
                Ok(ReconcileOutcome::done())
            }
            Ok(Stage::Completed) => {
                metrics::record_staged_reconcile(controller, StagedResult::Completed);
                Ok(ReconcileOutcome::done())
            }
            Ok(Stage::Handled(outcome)) => {
                metrics::record_staged_reconcile(controller, StagedResult::Success);
                Ok(outcome)
            }
            Err(err) => {
                metrics::record_staged_reconcile(controller, StagedResult::Error);
                log_warn(
                    controller,
                    "Staged reconcile failed",
                    &[("object", name), ("error", err.to_string().as_str())],
                );
                Err(err)
            }
        }
    }

    async fn run(&self, ctx: &ReconcileContext, name: &str) -> Result<Stage, SyncError> {
        let object = match self.store.get(name).await {
            Ok(object) => object,
            Err(err) if err.is_not_found() => return Ok(Stage::Skipped),
            Err(err) => return Err(err),
        };
        if self.reconciler.filter(&object) {
            return Ok(Stage::Skipped);
        }
        if object.is_deleting() {
            self.finalize(ctx, object).await?;
            return Ok(Stage::Completed);
        }

        let timed_out = object.is_timed_out(Utc::now());
        match self.reconciler.observe(ctx, &object).await {
            Ok(true) if !timed_out => return Ok(Stage::Skipped),
            Ok(_) => {}
            Err(err) if err.is_non_retryable() => {
                let completion = Completion::failed(REASON_JOB_FAILED, err.detail());
                self.complete(object, &completion).await?;
                return Ok(Stage::Completed);
            }
            Err(err) => return Err(err),
        }

        if timed_out {
            if object.is_finished() {
                return Ok(Stage::Skipped);
            }
            self.reconciler.timeout(ctx, &object).await?;
            let message = format!(
                "The job is timeout, timeoutSecond: {}",
                object.timeout_second()
            );
            self.complete(object, &Completion::failed(REASON_JOB_TIMEOUT, message))
                .await?;
            return Ok(Stage::Completed);
        }

        match self.reconciler.handle(ctx, &object).await {
            Ok(outcome) => Ok(Stage::Handled(outcome)),
            Err(err) if err.is_non_retryable() => {
                let completion = Completion::failed(REASON_JOB_FAILED, err.detail());
                self.complete(object, &completion).await?;
                Ok(Stage::Completed)
            }
            Err(err) => Err(err),
        }
    }

    /// Writes `completion` unless the object already finished.
    pub async fn complete(
        &self,
        object: R::Object,
        completion: &Completion,
    ) -> Result<R::Object, SyncError> {
        let mut updated = object;
        if !updated.complete(completion, Utc::now()) {
            return Ok(updated);
        }
        let stored = self.store.update(&updated).await?;
        log_info(
            self.reconciler.name(),
            "Job completed",
            &[
                ("object", stored.name()),
                ("reason", completion.reason.as_str()),
                ("message", completion.message.as_str()),
            ],
        );
        Ok(stored)
    }

    async fn finalize(&self, ctx: &ReconcileContext, object: R::Object) -> Result<(), SyncError> {
        let mut object = object;
        if !object.is_finished() {
            let completion = Completion::failed(REASON_JOB_STOPPED, "the job is stopped");
            object = self.complete(object, &completion).await?;
        }
        if !object.has_finalizer() {
            return Ok(());
        }
        self.reconciler.clear(ctx, &object).await?;
        for hook in &self.clear_hooks {
            hook.clear(ctx, &object).await?;
        }
        object.remove_finalizer();
        self.store.update(&object).await?;
        Ok(())
    }
}
