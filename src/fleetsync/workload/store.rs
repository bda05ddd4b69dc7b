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

use super::types::Workload;
use crate::fleetsync::syncer::error::{SyncError, SyncFuture};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Persistence contract for Logical Workloads.
///
/// `update_status` and `update` are conditional on `resource_version`
/// matching the stored record and fail with [`SyncError::Conflict`]
/// otherwise. `patch_annotations` is a merge patch and never conflicts;
/// a `None` value removes the key.
pub trait WorkloadStore: Send + Sync {
    fn get<'a>(&'a self, id: &'a str) -> SyncFuture<'a, Workload>;

    /// Persists only the status subresource.
    fn update_status<'a>(&'a self, workload: &'a Workload) -> SyncFuture<'a, Workload>;

    /// Persists status and annotations in one write.
    fn update<'a>(&'a self, workload: &'a Workload) -> SyncFuture<'a, Workload>;

    fn patch_annotations<'a>(
        &'a self,
        id: &'a str,
        patch: BTreeMap<String, Option<String>>,
    ) -> SyncFuture<'a, Workload>;
}

/// Process-local store used by tests and single-binary deployments.
#[derive(Default)]
pub struct InMemoryWorkloadStore {
    workloads: Mutex<HashMap<String, Workload>>,
    writes: AtomicUsize,
}

impl InMemoryWorkloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record without version checks.
    pub fn insert(&self, mut workload: Workload) -> Workload {
        let mut guard = self.workloads.lock().expect("workload store lock poisoned");
        workload.resource_version = guard
            .get(&workload.id)
            .map(|existing| existing.resource_version + 1)
            .unwrap_or(1);
        guard.insert(workload.id.clone(), workload.clone());
        workload
    }

    pub fn snapshot(&self, id: &str) -> Option<Workload> {
        let guard = self.workloads.lock().expect("workload store lock poisoned");
        guard.get(id).cloned()
    }

    /// Number of successful writes issued through the [`WorkloadStore`] API.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn conditional_write<F>(&self, workload: &Workload, apply: F) -> Result<Workload, SyncError>
    where
        F: FnOnce(&mut Workload, &Workload),
    {
        let mut guard = self.workloads.lock().expect("workload store lock poisoned");
        let stored = guard
            .get_mut(&workload.id)
            .ok_or_else(|| SyncError::not_found(format!("workload {}", workload.id)))?;
        if stored.resource_version != workload.resource_version {
            return Err(SyncError::conflict(format!(
                "workload {} has version {}, update carries {}",
                workload.id, stored.resource_version, workload.resource_version
            )));
        }
        apply(stored, workload);
        stored.resource_version += 1;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }
}

impl WorkloadStore for InMemoryWorkloadStore {
    fn get<'a>(&'a self, id: &'a str) -> SyncFuture<'a, Workload> {
        let result = self
            .snapshot(id)
            .ok_or_else(|| SyncError::not_found(format!("workload {id}")));
        Box::pin(async move { result })
    }

    fn update_status<'a>(&'a self, workload: &'a Workload) -> SyncFuture<'a, Workload> {
        let result = self.conditional_write(workload, |stored, incoming| {
            stored.status = incoming.status.clone();
        });
        Box::pin(async move { result })
    }

    fn update<'a>(&'a self, workload: &'a Workload) -> SyncFuture<'a, Workload> {
        let result = self.conditional_write(workload, |stored, incoming| {
            stored.status = incoming.status.clone();
            stored.annotations = incoming.annotations.clone();
        });
        Box::pin(async move { result })
    }

    fn patch_annotations<'a>(
        &'a self,
        id: &'a str,
        patch: BTreeMap<String, Option<String>>,
    ) -> SyncFuture<'a, Workload> {
        let result = {
            let mut guard = self.workloads.lock().expect("workload store lock poisoned");
            match guard.get_mut(id) {
                Some(stored) => {
                    for (key, value) in patch {
                        match value {
                            Some(value) => {
                                stored.annotations.insert(key, value);
                            }
                            None => {
                                stored.annotations.remove(&key);
                            }
                        }
                    }
                    stored.resource_version += 1;
                    self.writes.fetch_add(1, Ordering::SeqCst);
                    Ok(stored.clone())
                }
                None => Err(SyncError::not_found(format!("workload {id}"))),
            }
        };
        Box::pin(async move { result })
    }
}
