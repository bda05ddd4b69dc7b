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

use std::fmt;
use std::str::FromStr;

/// Deletion propagation policy sent with a delete call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeletionPropagation {
    /// Dependents are deleted before the object itself disappears.
    Foreground,
    #[default]
    Background,
    Orphan,
}

impl DeletionPropagation {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletionPropagation::Foreground => "Foreground",
            DeletionPropagation::Background => "Background",
            DeletionPropagation::Orphan => "Orphan",
        }
    }
}

impl fmt::Display for DeletionPropagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeletionPropagation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Foreground" => Ok(DeletionPropagation::Foreground),
            "Background" => Ok(DeletionPropagation::Background),
            "Orphan" => Ok(DeletionPropagation::Orphan),
            other => Err(format!("unsupported propagationPolicy '{other}'")),
        }
    }
}

/// Options for a delete call against a member cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DeleteOptions {
    pub propagation: DeletionPropagation,
    /// `Some(0)` removes the object without waiting for graceful termination.
    pub grace_period_seconds: Option<i64>,
}

impl DeleteOptions {
    /// Immediate foreground deletion used to break stuck finalizers.
    pub fn force() -> Self {
        Self {
            propagation: DeletionPropagation::Foreground,
            grace_period_seconds: Some(0),
        }
    }

    pub fn is_force(&self) -> bool {
        self.grace_period_seconds == Some(0)
    }
}
