use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::emoji_usage::EmojiUsageCollector;

#[derive(Debug)]
/// Handle for the single owned autosave task; dropping without `shutdown`
/// leaves the final flush to the host's own teardown path.
pub struct UsageAutosaveHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl UsageAutosaveHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Stops the autosave loop after one final flush.
    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Starts the autosave loop that periodically flushes usage counters.
/// Exactly one task owns the timer; lifecycle is tied to the returned handle.
pub fn start_usage_autosave(
    collector: Arc<EmojiUsageCollector>,
    interval: Duration,
) -> Result<UsageAutosaveHandle> {
    if interval.is_zero() {
        bail!("usage autosave interval must be greater than zero");
    }
    let handle = tokio::runtime::Handle::try_current()
        .context("usage autosave requires an active Tokio runtime")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = handle.spawn(run_usage_autosave_loop(collector, interval, shutdown_rx));
    Ok(UsageAutosaveHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn run_usage_autosave_loop(
    collector: Arc<EmojiUsageCollector>,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so a fresh start does not
    // rewrite the snapshot it just loaded.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match collector.flush() {
                    Ok(true) => tracing::debug!("usage snapshot flushed"),
                    Ok(false) => {}
                    Err(error) => {
                        tracing::warn!(%error, "usage snapshot flush failed; will retry next tick");
                    }
                }
            }
            _ = &mut shutdown_rx => {
                if let Err(error) = collector.flush() {
                    tracing::warn!(%error, "final usage snapshot flush failed");
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::start_usage_autosave;
    use crate::emoji_usage::EmojiUsageCollector;
    use crate::usage_store::{JsonUsageStore, UsageStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn unit_zero_interval_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let collector = Arc::new(EmojiUsageCollector::new(Arc::new(JsonUsageStore::new(
            temp.path(),
        ))));
        let error =
            start_usage_autosave(collector, Duration::ZERO).expect_err("zero interval fails");
        assert!(error.to_string().contains("greater than zero"));
    }

    #[tokio::test]
    async fn functional_shutdown_flushes_pending_counters() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(JsonUsageStore::new(temp.path()));
        let collector = Arc::new(EmojiUsageCollector::new(store.clone()));
        collector.load_snapshot().expect("load");

        let mut handle = start_usage_autosave(Arc::clone(&collector), Duration::from_secs(3600))
            .expect("start autosave");
        assert!(handle.is_running());

        collector.record_message("tenant-1", ":wave:");
        handle.shutdown().await;
        assert!(!handle.is_running());

        let persisted = store.load().expect("load snapshot");
        assert_eq!(persisted["tenant-1"]["wave"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_tick_flushes_dirty_counters() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(JsonUsageStore::new(temp.path()));
        let collector = Arc::new(EmojiUsageCollector::new(store.clone()));
        collector.load_snapshot().expect("load");

        let mut handle = start_usage_autosave(Arc::clone(&collector), Duration::from_millis(100))
            .expect("start autosave");
        collector.record_message("tenant-1", ":sun:");

        tokio::time::sleep(Duration::from_millis(250)).await;
        let persisted = store.load().expect("load snapshot");
        assert_eq!(persisted["tenant-1"]["sun"], 1);
        handle.shutdown().await;
    }
}
