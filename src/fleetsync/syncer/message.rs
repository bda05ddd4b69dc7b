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

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn pod() -> Self {
        Self::new("", "v1", "Pod")
    }

    pub fn event() -> Self {
        Self::new("", "v1", "Event")
    }

    pub fn job() -> Self {
        Self::new("batch", "v1", "Job")
    }

    pub fn deployment() -> Self {
        Self::new("apps", "v1", "Deployment")
    }

    pub fn statefulset() -> Self {
        Self::new("apps", "v1", "StatefulSet")
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceAction {
    Add,
    Update,
    Delete,
}

/// Job-like kinds whose status drives the workload phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLikeKind {
    Job,
    Deployment,
    StatefulSet,
}

impl JobLikeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobLikeKind::Job => "Job",
            JobLikeKind::Deployment => "Deployment",
            JobLikeKind::StatefulSet => "StatefulSet",
        }
    }
}

/// Closed set of handler routes for a change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    JobLike(JobLikeKind),
    Pod,
    Event,
}

impl ResourceClass {
    pub fn classify(kind: &str) -> Option<Self> {
        match kind {
            "Job" => Some(ResourceClass::JobLike(JobLikeKind::Job)),
            "Deployment" => Some(ResourceClass::JobLike(JobLikeKind::Deployment)),
            "StatefulSet" => Some(ResourceClass::JobLike(JobLikeKind::StatefulSet)),
            "Pod" => Some(ResourceClass::Pod),
            "Event" => Some(ResourceClass::Event),
            _ => None,
        }
    }

    /// Metric label for the route.
    pub fn label(self) -> &'static str {
        match self {
            ResourceClass::JobLike(_) => "job",
            ResourceClass::Pod => "pod",
            ResourceClass::Event => "event",
        }
    }
}

/// "This resource in this cluster changed." Carries identity only; handlers
/// re-fetch the object through the cluster gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub cluster: String,
    pub gvk: GroupVersionKind,
    pub namespace: String,
    pub name: String,
    #[serde(rename = "workloadId")]
    pub workload_id: String,
    /// Dispatch round the resource was created for; zero when unknown.
    #[serde(rename = "dispatchCount", default)]
    pub dispatch_count: u32,
    pub action: ResourceAction,
}

impl ChangeMessage {
    pub fn new(
        cluster: &str,
        gvk: GroupVersionKind,
        namespace: &str,
        name: &str,
        workload_id: &str,
        action: ResourceAction,
    ) -> Self {
        Self {
            cluster: cluster.to_string(),
            gvk,
            namespace: namespace.to_string(),
            name: name.to_string(),
            workload_id: workload_id.to_string(),
            dispatch_count: 0,
            action,
        }
    }

    pub fn with_dispatch_count(mut self, dispatch_count: u32) -> Self {
        self.dispatch_count = dispatch_count;
        self
    }

    pub fn is_delete(&self) -> bool {
        self.action == ResourceAction::Delete
    }

    pub fn resource_class(&self) -> Option<ResourceClass> {
        ResourceClass::classify(&self.gvk.kind)
    }

    /// True when the message belongs to an earlier dispatch round than `current`.
    pub fn is_stale(&self, current: u32) -> bool {
        self.dispatch_count != 0 && self.dispatch_count < current
    }
}

impl fmt::Display for ChangeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}",
            self.cluster, self.gvk.kind, self.namespace, self.name
        )
    }
}
