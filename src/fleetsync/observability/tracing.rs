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

//! Span identifiers for syncer log lines. Every Change Message is handled
//! inside [`with_span`], which publishes a `tracing` span and keeps a
//! task-local [`TraceContext`] so the logger can stamp `trace_id` and
//! `span_id` onto each line written while the message is processed.

use rand::{rngs::OsRng, RngCore};
use std::fmt::Write;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::task_local;
use tracing::Instrument;
use tracing_subscriber::registry::Registry;

const TRACE_ID_BYTES: usize = 16;
const SPAN_ID_BYTES: usize = 8;

#[derive(Clone, Debug)]
pub struct TraceContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
}

impl TraceContext {
    fn root() -> Self {
        Self {
            trace_id: Arc::from(random_hex(TRACE_ID_BYTES)),
            span_id: Arc::from(random_hex(SPAN_ID_BYTES)),
        }
    }

    fn child(&self) -> Self {
        Self {
            trace_id: Arc::clone(&self.trace_id),
            span_id: Arc::from(random_hex(SPAN_ID_BYTES)),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }
}

task_local! {
    static ACTIVE_TRACE: TraceContext;
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once per process.
pub fn init() {
    TRACING_INIT.get_or_init(|| {
        // Embedding applications may already own the global subscriber.
        let _ = tracing::subscriber::set_global_default(Registry::default());
    });
}

pub fn current_context() -> Option<TraceContext> {
    ACTIVE_TRACE.try_with(|ctx| ctx.clone()).ok()
}

/// Runs `fut` inside a span. Nested calls keep the parent's trace id and
/// mint a fresh span id.
pub async fn with_span<T>(
    component: &'static str,
    span_name: impl Into<String>,
    fut: impl Future<Output = T>,
) -> T {
    let context = match current_context() {
        Some(parent) => parent.child(),
        None => TraceContext::root(),
    };
    let name = span_name.into();
    let span = tracing::info_span!(
        "fleetsync",
        component = component,
        span = name.as_str(),
        trace_id = context.trace_id(),
        span_id = context.span_id(),
    );

    ACTIVE_TRACE.scope(context, fut.instrument(span)).await
}

fn random_hex(bytes: usize) -> String {
    let mut data = vec![0u8; bytes];
    OsRng.fill_bytes(&mut data);
    data.iter().fold(String::with_capacity(bytes * 2), |mut out, byte| {
        let _ = write!(&mut out, "{:02x}", byte);
        out
    })
}
