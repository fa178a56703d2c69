//! 連携レイヤーの組み立てと管理操作

use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::AuditLogger;
use crate::batch::{BatchProcessor, BatchStatsSnapshot};
use crate::client::JiraClient;
use crate::config::IntegrationConfig;
use crate::connection_pool::{ConnectionPool, ConnectionPoolStats};
use crate::error::Result;
use crate::monitor::{HealthMonitor, HealthStatus, HourlyReport, SystemMetrics};
use crate::persistence::{CredentialSource, SecretDecryptor, SyncRecordStore};
use crate::sync::{RecordOutcome, SyncReconciler};

/// 接続プール・クライアント・監視・監査・バッチ・同期ループをまとめたもの
pub struct JiraIntegration {
    config: IntegrationConfig,
    pool: Arc<ConnectionPool>,
    monitor: Arc<HealthMonitor>,
    audit: Option<Arc<AuditLogger>>,
    client: Arc<JiraClient>,
    batch: Arc<BatchProcessor>,
    reconciler: Arc<SyncReconciler>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JiraIntegration {
    pub fn new(
        config: IntegrationConfig,
        store: Arc<dyn SyncRecordStore>,
        credentials: Arc<dyn CredentialSource>,
        decryptor: Arc<dyn SecretDecryptor>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(ConnectionPool::new(config.pool.clone(), config.client.clone()));
        let monitor = Arc::new(HealthMonitor::new(config.monitor.clone()));
        let audit = config
            .audit
            .enabled
            .then(|| Arc::new(AuditLogger::new(config.audit.clone())));

        let mut client = JiraClient::new(Arc::clone(&pool), Arc::clone(&monitor));
        if let Some(audit) = &audit {
            client = client.with_audit(Arc::clone(audit));
        }
        let client = Arc::new(client);

        let mut batch = BatchProcessor::new(config.batch.clone(), Arc::clone(&client));
        if let Some(audit) = &audit {
            batch = batch.with_audit(Arc::clone(audit));
        }
        let batch = Arc::new(batch);

        let reconciler = Arc::new(SyncReconciler::new(
            config.scheduler.clone(),
            store,
            credentials,
            decryptor,
            Arc::clone(&client),
        ));

        Ok(Self {
            config,
            pool,
            monitor,
            audit,
            client,
            batch,
            reconciler,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn client(&self) -> &Arc<JiraClient> {
        &self.client
    }

    pub fn batch(&self) -> &Arc<BatchProcessor> {
        &self.batch
    }

    pub fn reconciler(&self) -> &Arc<SyncReconciler> {
        &self.reconciler
    }

    pub fn audit(&self) -> Option<&Arc<AuditLogger>> {
        self.audit.as_ref()
    }

    /// 監査ログの書き込みスレッドと定期タスクを開始
    pub fn start(&self) -> Result<()> {
        if let Some(audit) = &self.audit {
            audit.start()?;
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            warn!("Jira integration already started");
            return Ok(());
        }

        tasks.push(self.pool.start_cleanup(self.shutdown.child_token()));
        tasks.push(self.batch.start_cleanup(self.shutdown.child_token()));
        if self.monitor.is_enabled() {
            tasks.push(self.monitor.start_cleanup(self.shutdown.child_token()));
        }
        tasks.extend(self.reconciler.start(self.shutdown.child_token()));

        info!(
            background_tasks = tasks.len(),
            scheduler_enabled = self.config.scheduler.enabled,
            audit_enabled = self.audit.is_some(),
            "Jira integration started"
        );
        Ok(())
    }

    /// 定期タスクを止め、バッチを中断し、監査ログを書き出してから接続を破棄
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.batch.shutdown();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Some(audit) = &self.audit {
            let audit = Arc::clone(audit);
            if let Err(e) = tokio::task::spawn_blocking(move || audit.shutdown()).await {
                warn!(error = %e, "Audit logger shutdown failed");
            }
        }

        self.pool.shutdown();
        info!("Jira integration shut down");
    }

    pub fn pool_stats(&self) -> ConnectionPoolStats {
        self.pool.stats()
    }

    pub fn evict_connection(&self, server_url: &str) -> Result<bool> {
        self.pool.evict(server_url)
    }

    pub fn evict_all_connections(&self) -> usize {
        self.pool.evict_all()
    }

    pub fn system_metrics(&self) -> SystemMetrics {
        self.monitor.snapshot()
    }

    pub fn hourly_metrics(&self) -> Vec<HourlyReport> {
        self.monitor.hourly_metrics()
    }

    pub fn system_report(&self) -> String {
        self.monitor.report()
    }

    pub fn reset_metrics(&self) {
        self.monitor.reset();
        if let Some(audit) = &self.audit {
            audit.log_configuration_change("system", "reset_metrics", "Jira monitoring metrics reset");
        }
    }

    /// 監視結果に接続プールとバッチ処理の状況を加えたヘルスチェック
    pub fn health(&self) -> HealthStatus {
        let pool = self.pool.stats();
        let batch = self.batch.summary();

        self.monitor
            .health()
            .with_detail(
                "connectionPool",
                json!({
                    "activeConnections": pool.active_connections,
                    "cachedConnections": pool.cached_connections,
                    "maxConnections": pool.max_connections,
                    "reuseRate": pool.reuse_rate(),
                }),
            )
            .with_detail(
                "batchProcessing",
                json!({
                    "activeOperations": batch.active_operations,
                    "completedOperations": batch.completed_operations,
                    "availableWorkers": batch.available_workers,
                    "maxThreads": batch.max_threads,
                }),
            )
    }

    pub fn batch_stats(&self, operation_id: &str) -> Option<BatchStatsSnapshot> {
        self.batch.stats(operation_id)
    }

    pub fn all_batch_stats(&self) -> Vec<BatchStatsSnapshot> {
        self.batch.all_stats()
    }

    pub fn cancel_batch(&self, operation_id: &str) -> bool {
        self.batch.cancel(operation_id)
    }

    pub async fn sync_now(&self, record_id: &str) -> Result<RecordOutcome> {
        self.reconciler.sync_now(record_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditConfig;
    use crate::memory_store::{InMemoryCredentialSource, InMemorySyncStore, PlainTextDecryptor};
    use tempfile::TempDir;

    fn integration(config: IntegrationConfig) -> JiraIntegration {
        JiraIntegration::new(
            config,
            Arc::new(InMemorySyncStore::new()),
            Arc::new(InMemoryCredentialSource::new()),
            Arc::new(PlainTextDecryptor),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_health_includes_pool_and_batch() {
        // Given: 既定設定
        let integration = integration(IntegrationConfig::default());
        integration.pool.acquire("https://example.atlassian.net").unwrap();

        // When: ヘルスチェック
        let health = integration.health();

        // Then: 監視・プール・バッチの詳細が揃う
        assert!(health.up);
        assert_eq!(health.details["connectionPool"]["activeConnections"], 1);
        assert_eq!(health.details["batchProcessing"]["maxThreads"], 5);
        assert!(health.details.contains_key("successRate"));
    }

    #[tokio::test]
    async fn test_evict_connections() {
        let integration = integration(IntegrationConfig::default());
        integration.pool.acquire("https://a.example.com").unwrap();
        integration.pool.acquire("https://b.example.com").unwrap();

        assert!(integration.evict_connection("https://a.example.com").unwrap());
        assert!(!integration.evict_connection("https://a.example.com").unwrap());
        assert_eq!(integration.evict_all_connections(), 1);
        assert_eq!(integration.pool_stats().active_connections, 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown_with_audit() {
        // Given: 監査ログ有効
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("audit.log");
        let config = IntegrationConfig::default().audit(
            AuditConfig::default()
                .enabled(true)
                .file_path(&path)
                .flush_interval_ms(10)
                .poll_interval_ms(10),
        );
        let integration = integration(config);

        // When: 起動して停止
        integration.start().unwrap();
        integration.reset_metrics();
        integration.shutdown().await;

        // Then: 開始・設定変更・終了が記録される
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("SERVICE_START"));
        assert!(contents.contains("CONFIG_CHANGE"));
        assert!(contents.contains("SERVICE_STOP"));
        assert_eq!(integration.pool_stats().active_connections, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = IntegrationConfig::default();
        config.batch.batch_size = 0;

        let result = JiraIntegration::new(
            config,
            Arc::new(InMemorySyncStore::new()),
            Arc::new(InMemoryCredentialSource::new()),
            Arc::new(PlainTextDecryptor),
        );

        assert!(result.is_err());
    }
}
