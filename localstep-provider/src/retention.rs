//! Background purge of finished executions.

use crate::config::RetentionConfig;
use crate::provider::StepFunctionsProvider;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Periodically drops terminal executions older than the configured TTL.
pub struct RetentionManager {
    provider: Arc<StepFunctionsProvider>,
    config: RetentionConfig,
    purged_total: AtomicU64,
    last_run: parking_lot::Mutex<Option<Instant>>,
    shutdown: AtomicBool,
    notify: Notify,
}

impl RetentionManager {
    pub fn new(provider: Arc<StepFunctionsProvider>, config: RetentionConfig) -> Self {
        Self {
            provider,
            config,
            purged_total: AtomicU64::new(0),
            last_run: parking_lot::Mutex::new(None),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Runs one purge pass and returns how many executions were dropped.
    pub fn run_once(&self) -> usize {
        if self.config.is_disabled() {
            return 0;
        }
        let purged = self.provider.purge_completed(self.config.ttl());
        self.purged_total.fetch_add(purged as u64, Ordering::Relaxed);
        *self.last_run.lock() = Some(Instant::now());
        if purged > 0 {
            tracing::debug!("Purged {} finished executions", purged);
        }
        purged
    }

    /// Runs the purge loop (call from a background task).
    pub async fn run(&self) {
        if self.config.is_disabled() {
            tracing::info!("Execution retention is disabled");
            return;
        }

        tracing::info!(
            "Retention manager started (ttl_secs={}, check_interval_secs={})",
            self.config.completed_ttl_secs,
            self.config.check_interval().as_secs()
        );

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.check_interval()) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.run_once();
        }

        tracing::info!("Retention manager stopped");
    }

    /// Signals the loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn stats(&self) -> RetentionStats {
        RetentionStats {
            purged_total: self.purged_total.load(Ordering::Relaxed),
            since_last_run: self.last_run.lock().map(|at| at.elapsed()),
        }
    }
}

#[derive(Debug)]
pub struct RetentionStats {
    pub purged_total: u64,
    /// `None` until the first pass.
    pub since_last_run: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    fn provider_with_finished_execution() -> Arc<StepFunctionsProvider> {
        let provider = Arc::new(StepFunctionsProvider::from_config(&Config::default()));
        let definition = json!({"StartAt": "Done", "States": {"Done": {"Type": "Succeed"}}});
        let arn = provider
            .create_state_machine("quick", &definition.to_string(), None)
            .unwrap()
            .state_machine_arn;
        let description = tokio_test::block_on(provider.start_sync_execution(&arn, None, None))
            .unwrap();
        assert!(description.status.is_terminal());
        provider
    }

    #[test]
    fn test_run_once_respects_ttl() {
        let provider = provider_with_finished_execution();
        let manager = RetentionManager::new(provider.clone(), RetentionConfig::default());
        assert_eq!(manager.run_once(), 0);
        assert_eq!(provider.execution_count(), 1);
        assert!(manager.stats().since_last_run.is_some());
    }

    #[test]
    fn test_disabled_retention_keeps_everything() {
        let provider = provider_with_finished_execution();
        let config = RetentionConfig {
            completed_ttl_secs: 0,
            check_interval_secs: 1,
        };
        let manager = RetentionManager::new(provider.clone(), config);
        assert_eq!(manager.run_once(), 0);
        assert!(manager.stats().since_last_run.is_none());
        assert_eq!(provider.execution_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_purges_and_shuts_down() {
        let provider = Arc::new(StepFunctionsProvider::from_config(&Config::default()));
        let definition = json!({"StartAt": "Done", "States": {"Done": {"Type": "Succeed"}}});
        let arn = provider
            .create_state_machine("quick", &definition.to_string(), None)
            .unwrap()
            .state_machine_arn;
        provider.start_sync_execution(&arn, None, None).await.unwrap();

        let config = RetentionConfig {
            completed_ttl_secs: 1,
            check_interval_secs: 1,
        };
        let manager = Arc::new(RetentionManager::new(provider.clone(), config));
        let handle = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });

        // Paused time advances the loop but not the wall clock used for TTLs.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(manager.stats().since_last_run.is_some());

        manager.shutdown();
        handle.await.unwrap();
    }
}
