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

use crate::fleetsync::controller::reconcile::StagedObject;
use crate::fleetsync::syncer::error::{SyncError, SyncFuture};
use std::collections::HashMap;
use std::sync::Mutex;

/// Versioned persistence for staged objects. `update` fails with
/// [`SyncError::Conflict`] when the stored version moved on.
pub trait ObjectStore<O>: Send + Sync {
    fn get<'a>(&'a self, name: &'a str) -> SyncFuture<'a, O>;

    fn update<'a>(&'a self, object: &'a O) -> SyncFuture<'a, O>;
}

/// Keeps objects in memory. An object that is being deleted and has no
/// finalizer left disappears on update, as it would from the API server.
pub struct InMemoryObjectStore<O> {
    objects: Mutex<HashMap<String, O>>,
}

impl<O: StagedObject> Default for InMemoryObjectStore<O> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }
}

impl<O: StagedObject> InMemoryObjectStore<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut object: O) -> O {
        let mut guard = self.objects.lock().expect("object store lock poisoned");
        let version = guard
            .get(object.name())
            .map(|existing| existing.resource_version() + 1)
            .unwrap_or(1);
        object.set_resource_version(version);
        guard.insert(object.name().to_string(), object.clone());
        object
    }

    pub fn snapshot(&self, name: &str) -> Option<O> {
        let guard = self.objects.lock().expect("object store lock poisoned");
        guard.get(name).cloned()
    }

    fn write(&self, object: &O) -> Result<O, SyncError> {
        let mut guard = self.objects.lock().expect("object store lock poisoned");
        let stored = guard
            .get(object.name())
            .ok_or_else(|| SyncError::not_found(format!("object {}", object.name())))?;
        if stored.resource_version() != object.resource_version() {
            return Err(SyncError::conflict(format!(
                "object {} has version {}, update carries {}",
                object.name(),
                stored.resource_version(),
                object.resource_version()
            )));
        }
        let mut updated = object.clone();
        updated.set_resource_version(object.resource_version() + 1);
        if updated.is_deleting() && !updated.has_finalizer() {
            guard.remove(object.name());
        } else {
            guard.insert(updated.name().to_string(), updated.clone());
        }
        Ok(updated)
    }
}

impl<O: StagedObject> ObjectStore<O> for InMemoryObjectStore<O> {
    fn get<'a>(&'a self, name: &'a str) -> SyncFuture<'a, O> {
        let result = self
            .snapshot(name)
            .ok_or_else(|| SyncError::not_found(format!("object {name}")));
        Box::pin(async move { result })
    }

    fn update<'a>(&'a self, object: &'a O) -> SyncFuture<'a, O> {
        let result = self.write(object);
        Box::pin(async move { result })
    }
}
