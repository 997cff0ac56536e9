//! Bounded work queues.
//!
//! Background work (analysis, byte deletion) is published to a bounded
//! queue and consumed by a fixed number of workers. Publishers wait
//! while the queue is full.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use crate::error::{ServerError, ServerResult};

/// A bounded multi-consumer queue.
pub struct TaskQueue<T> {
    name: &'static str,
    sender: mpsc::Sender<T>,
    receiver: Arc<Mutex<mpsc::Receiver<T>>>,

    /// Tasks published but not yet finished.
    outstanding: Arc<AtomicUsize>,
}

impl<T: Send + 'static> TaskQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);

        Self {
            name,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publishes a task, waiting for room if the queue is full.
    pub async fn publish(&self, task: T) -> ServerResult<()> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);

        self.sender.send(task).await.map_err(|_| {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            ServerError::RequestError(anyhow::anyhow!("The {} queue is closed", self.name))
        })
    }

    /// Waits until every published task has been handled.
    ///
    /// Only returns if workers are running.
    pub async fn wait_idle(&self) {
        while self.outstanding.load(Ordering::SeqCst) > 0 {
            time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Returns the number of tasks waiting.
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns workers consuming the queue.
    ///
    /// Failed tasks are logged and dropped.
    pub fn spawn_workers<F, Fut>(&self, count: usize, handler: F) -> Vec<JoinHandle<()>>
    where
        F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ServerResult<()>> + Send + 'static,
    {
        (0..count)
            .map(|worker| {
                let name = self.name;
                let receiver = self.receiver.clone();
                let outstanding = self.outstanding.clone();
                let handler = handler.clone();

                tokio::spawn(async move {
                    loop {
                        // Only one idle worker waits on the channel at a time
                        let task = receiver.lock().await.recv().await;

                        let Some(task) = task else {
                            tracing::debug!("{} worker {} exiting", name, worker);
                            return;
                        };

                        let start = Instant::now();
                        match handler(task).await {
                            Ok(()) => {
                                tracing::debug!(
                                    "{} worker {} finished a task in {:?}",
                                    name,
                                    worker,
                                    start.elapsed()
                                );
                            }
                            Err(e) => {
                                tracing::warn!("{} worker {} failed a task: {}", name, worker, e);
                            }
                        }

                        outstanding.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect()
    }
}

impl<T> fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("capacity", &self.sender.max_capacity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_workers_consume_all_tasks() {
        let queue = TaskQueue::new("test", 4);
        let processed = Arc::new(AtomicUsize::new(0));

        let handles = queue.spawn_workers(3, {
            let processed = processed.clone();
            move |n: usize| {
                let processed = processed.clone();
                async move {
                    processed.fetch_add(n, Ordering::SeqCst);
                    Ok(())
                }
            }
        });

        for _ in 0..20 {
            queue.publish(1).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .unwrap();

        assert_eq!(20, processed.load(Ordering::SeqCst));
        assert!(queue.is_empty());
        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_failed_task_does_not_stop_worker() {
        let queue = TaskQueue::new("test", 4);
        let processed = Arc::new(AtomicUsize::new(0));

        queue.spawn_workers(1, {
            let processed = processed.clone();
            move |fail: bool| {
                let processed = processed.clone();
                async move {
                    processed.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        Err(ServerError::NoSuchAttachment)
                    } else {
                        Ok(())
                    }
                }
            }
        });

        queue.publish(true).await.unwrap();
        queue.publish(false).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while processed.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
