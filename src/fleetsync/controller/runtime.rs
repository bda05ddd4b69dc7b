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


use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bounded FIFO shared by producers and a pool of workers.
pub struct WorkQueue<T> {
    inner: Arc<WorkQueueInner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct WorkQueueInner<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
}

impl<T> WorkQueue<T>
where
    T: Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(WorkQueueInner {
                sender,
                receiver: Mutex::new(receiver),
            }),
        }
    }

    pub async fn enqueue(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        self.inner.sender.send(item).await
    }

    /// Delivers `item` once `delay` elapsed. Dropped silently when `cancel`
    /// fires first.
    pub fn enqueue_after(&self, item: T, delay: Duration, cancel: CancellationToken) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = queue.enqueue(item).await;
                }
            }
        });
    }

    pub async fn next(&self) -> Option<T> {
        let mut guard = self.inner.receiver.lock().await;
        guard.recv().await
    }

    /// Number of items waiting to be taken.
    pub fn pending(&self) -> usize {
        self.inner.sender.max_capacity() - self.inner.sender.capacity()
    }
}

/// Spawns `workers` tasks that drain `queue` through `handler` until
/// `cancel` fires.
pub fn spawn_workers<T, H, Fut>(
    queue: WorkQueue<T>,
    workers: usize,
    cancel: CancellationToken,
    handler: H,
) -> Vec<JoinHandle<()>>
where
    T: Send + 'static,
    H: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);
    (0..workers.max(1))
        .map(|_| {
            let queue = queue.clone();
            let cancel = cancel.clone();
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => break,
                        item = queue.next() => item,
                    };
                    let Some(item) = item else {
                        break;
                    };
                    (handler.as_ref())(item).await;
                }
            })
        })
        .collect()
}
