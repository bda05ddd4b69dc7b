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

use futures_util::future::BoxFuture;
use std::error::Error;
use std::fmt;

/// Future returned by the object-safe collaborator traits.
pub type SyncFuture<'a, T> = BoxFuture<'a, Result<T, SyncError>>;

/// Failure classes surfaced by gateways, stores, and handlers.
///
/// The dispatcher decides the fate of a message from the variant alone:
/// `NonRetryable` drops it, `Unrecoverable` fails the workload, everything
/// else requeues with backoff.
#[derive(Debug)]
pub enum SyncError {
    /// The addressed object does not exist.
    NotFound(String),
    /// An optimistic update lost against a newer version.
    Conflict(String),
    /// A dependency is temporarily unavailable.
    Transient(String),
    /// The input can never be processed (malformed or unparseable object).
    NonRetryable(String),
    /// A business invariant was violated; the workload must fail.
    Unrecoverable(String),
    /// Opaque failure reported by a cluster gateway.
    Gateway(Box<dyn Error + Send + Sync>),
}

impl SyncError {
    pub fn not_found(message: impl Into<String>) -> Self {
        SyncError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        SyncError::Conflict(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        SyncError::Transient(message.into())
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        SyncError::NonRetryable(message.into())
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        SyncError::Unrecoverable(message.into())
    }

    pub fn gateway<E>(error: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        SyncError::Gateway(error.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict(_))
    }

    pub fn is_non_retryable(&self) -> bool {
        matches!(self, SyncError::NonRetryable(_))
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, SyncError::Unrecoverable(_))
    }

    /// Short label used in log metadata.
    pub fn class(&self) -> &'static str {
        match self {
            SyncError::NotFound(_) => "not_found",
            SyncError::Conflict(_) => "conflict",
            SyncError::Transient(_) => "transient",
            SyncError::NonRetryable(_) => "non_retryable",
            SyncError::Unrecoverable(_) => "unrecoverable",
            SyncError::Gateway(_) => "gateway",
        }
    }

    /// Message without the classification prefix, suitable for user-facing status.
    pub fn detail(&self) -> String {
        match self {
            SyncError::NotFound(msg)
            | SyncError::Conflict(msg)
            | SyncError::Transient(msg)
            | SyncError::NonRetryable(msg)
            | SyncError::Unrecoverable(msg) => msg.clone(),
            SyncError::Gateway(err) => err.to_string(),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::NotFound(msg) => write!(f, "not found: {msg}"),
            SyncError::Conflict(msg) => write!(f, "conflict: {msg}"),
            SyncError::Transient(msg) => write!(f, "transient failure: {msg}"),
            SyncError::NonRetryable(msg) => write!(f, "non-retryable: {msg}"),
            SyncError::Unrecoverable(msg) => write!(f, "unrecoverable: {msg}"),
            SyncError::Gateway(err) => write!(f, "cluster gateway error: {err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncError::Gateway(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::NonRetryable(format!("failed to decode object: {err}"))
    }
}
