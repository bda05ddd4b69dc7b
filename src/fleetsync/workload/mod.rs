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

//! The Logical Workload record and the store contract it is persisted through.

pub mod store;
pub mod types;

pub use store::{InMemoryWorkloadStore, WorkloadStore};
pub use types::{
    Condition, ConditionType, ContainerTermination, PodRecord, Workload, WorkloadKind,
    WorkloadPhase, WorkloadSpec, WorkloadStatus,
};
