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

use super::error::SyncFuture;
use super::message::GroupVersionKind;
use crate::fleetsync::controller::delete::DeleteOptions;
use crate::fleetsync::k8s::node::Node;
use crate::fleetsync::k8s::pod::Pod;
use crate::fleetsync::k8s::statefulset::LabelSelector;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Read/write access to one member cluster.
///
/// Missing objects are reported as [`SyncError::NotFound`](super::error::SyncError::NotFound).
pub trait ClusterGateway: Send + Sync {
    fn get_object<'a>(
        &'a self,
        gvk: &'a GroupVersionKind,
        name: &'a str,
        namespace: &'a str,
    ) -> SyncFuture<'a, Value>;

    fn delete_pod<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        options: DeleteOptions,
    ) -> SyncFuture<'a, ()>;

    fn list_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> SyncFuture<'a, Vec<Pod>>;

    fn get_node<'a>(&'a self, name: &'a str) -> SyncFuture<'a, Node>;

    /// Returns the last `tail_lines` lines of a container log.
    fn pod_logs<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        container: &'a str,
        tail_lines: usize,
    ) -> SyncFuture<'a, String>;
}

/// Gateways keyed by cluster name, owned by the syncer rather than the process.
#[derive(Default)]
pub struct ClusterRegistry {
    clusters: RwLock<HashMap<String, Arc<dyn ClusterGateway>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `gateway`, returning the handle it replaced.
    pub fn add(
        &self,
        name: impl Into<String>,
        gateway: Arc<dyn ClusterGateway>,
    ) -> Option<Arc<dyn ClusterGateway>> {
        let mut guard = self.clusters.write().expect("cluster registry poisoned");
        guard.insert(name.into(), gateway)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ClusterGateway>> {
        let guard = self.clusters.read().expect("cluster registry poisoned");
        guard.get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn ClusterGateway>> {
        let mut guard = self.clusters.write().expect("cluster registry poisoned");
        guard.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let guard = self.clusters.read().expect("cluster registry poisoned");
        let mut names: Vec<String> = guard.keys().cloned().collect();
        names.sort();
        names
    }
}
