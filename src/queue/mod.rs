//! Durable task queue over redis lists.
//!
//! Producers `LPUSH` serialised payloads onto a named queue; the worker runs
//! N consumer loops that `BRPOP` and hand payloads to a [`TaskHandler`]. A
//! popped task is executed at most once: failures are logged, not
//! re-enqueued.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Blocking-pop patience per poll; loops re-check for shutdown in between.
const POP_TIMEOUT: Duration = Duration::from_secs(2);

fn queue_key(task_name: &str) -> String {
    format!("queue:{task_name}")
}

/// Handles one task payload. Implementations must be safe to call
/// concurrently.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<()>;
}

/// Producer half: enqueue tasks by name.
#[derive(Clone)]
pub struct TaskQueue {
    conn: ConnectionManager,
}

impl TaskQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Push a serialised payload onto the named queue.
    pub async fn enqueue(&self, task_name: &str, payload: &[u8]) -> Result<()> {
        let key = queue_key(task_name);
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lpush(&key, payload)
            .await
            .with_context(|| format!("enqueueing task on {key}"))?;
        Ok(())
    }
}

/// Consumer half: N concurrent handler loops for one task name.
pub struct QueueWorker {
    client: redis::Client,
    task_name: String,
    concurrency: usize,
    handler: Arc<dyn TaskHandler>,
}

impl QueueWorker {
    pub fn new(
        client: redis::Client,
        task_name: impl Into<String>,
        concurrency: usize,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            client,
            task_name: task_name.into(),
            concurrency: concurrency.max(1),
            handler,
        }
    }

    /// Run consumer loops until `stop` flips to true, then drain.
    pub async fn run(&self, stop: watch::Receiver<bool>) {
        info!(
            task = %self.task_name,
            concurrency = self.concurrency,
            "queue worker started"
        );

        let mut loops = JoinSet::new();
        for worker_id in 0..self.concurrency {
            let client = self.client.clone();
            let task_name = self.task_name.clone();
            let handler = Arc::clone(&self.handler);
            let mut stop = stop.clone();
            loops.spawn(async move {
                let key = queue_key(&task_name);
                // Each loop keeps its own connection so BRPOP only ever
                // blocks itself.
                let mut conn = loop {
                    match client.get_multiplexed_async_connection().await {
                        Ok(conn) => break conn,
                        Err(err) => {
                            error!(worker_id, %err, "queue connection failed, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            if *stop.borrow() {
                                return;
                            }
                        }
                    }
                };

                loop {
                    if *stop.borrow() {
                        return;
                    }

                    let popped: Result<Option<(String, Vec<u8>)>, redis::RedisError> = tokio::select! {
                        _ = stop.changed() => return,
                        popped = conn.brpop(&key, POP_TIMEOUT.as_secs_f64()) => popped,
                    };

                    match popped {
                        Ok(Some((_, payload))) => {
                            if let Err(err) = handler.handle(&payload).await {
                                error!(task = %task_name, %err, "task handler failed");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(worker_id, %err, "queue pop failed, backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            });
        }

        while loops.join_next().await.is_some() {}
        info!(task = %self.task_name, "queue worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_key_is_namespaced() {
        assert_eq!(queue_key("session:create"), "queue:session:create");
    }
}
