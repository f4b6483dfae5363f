use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

/// Fire-and-forget side effects. Failures are logged and never reach the
/// request that triggered them.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks;

impl BackgroundTasks {
    pub fn new() -> Self {
        Self
    }

    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let span = tracing::info_span!("background", task = name);
        tokio::spawn(
            async move {
                match task.await {
                    Ok(()) => debug!("background task finished"),
                    Err(e) => error!(error = ?e, "background task failed"),
                }
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn test_failures_do_not_propagate() {
        let tasks = BackgroundTasks::new();
        let handle = tasks.spawn("failing", async { Err::<(), _>(anyhow::anyhow!("boom")) });
        // the task itself completes normally
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_runs_task() {
        let tasks = BackgroundTasks::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        tasks
            .spawn("flag", async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            })
            .await
            .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
