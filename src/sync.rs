//! 同期記録の突き合わせループ
//!
//! 各サイクルは次の順で動く:
//! 1. IN_PROGRESS のまま `timeout_minutes` を過ぎた記録を RETRY_REQUIRED に戻す
//! 2. NOT_SYNCED / FAILED / RETRY_REQUIRED の記録を1ページ分取得し、並行に Jira へ反映する
//!
//! これとは別の周期で、`retry_delay_minutes` を過ぎた FAILED を RETRY_REQUIRED に戻す。

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::JiraClient;
use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::credentials::{Credentials, is_valid_issue_key};
use crate::error::{Error, Result};
use crate::persistence::{CredentialSource, SecretDecryptor, SyncRecord, SyncRecordStore, SyncStatus};

const RECLAIM_NOTE: &str = "処理がタイムアウトしたため再試行待ちに戻しました";

/// 1件の処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOutcome {
    Succeeded,
    Failed,
    /// 対象外、または他のワーカーが処理中
    Skipped,
}

/// 1回のパスの集計
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPassReport {
    pub reclaimed: usize,
    pub picked: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SyncPassReport {
    fn add(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Succeeded => self.succeeded += 1,
            RecordOutcome::Failed => self.failed += 1,
            RecordOutcome::Skipped => self.skipped += 1,
        }
    }
}

pub struct SyncReconciler {
    config: SchedulerConfig,
    store: Arc<dyn SyncRecordStore>,
    credentials: Arc<dyn CredentialSource>,
    decryptor: Arc<dyn SecretDecryptor>,
    client: Arc<JiraClient>,
    clock: Arc<dyn Clock>,
}

impl SyncReconciler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn SyncRecordStore>,
        credentials: Arc<dyn CredentialSource>,
        decryptor: Arc<dyn SecretDecryptor>,
        client: Arc<JiraClient>,
    ) -> Self {
        Self {
            config,
            store,
            credentials,
            decryptor,
            client,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 滞留した IN_PROGRESS を RETRY_REQUIRED に戻す
    pub async fn reclaim_stuck(&self) -> Result<usize> {
        let threshold = self.clock.now() - ChronoDuration::minutes(self.config.timeout_minutes);
        let stuck = self.store.find_stuck_since(threshold).await?;
        if stuck.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = stuck.into_iter().map(|record| record.id).collect();
        let reclaimed = self
            .store
            .update_status(&ids, SyncStatus::RetryRequired, Some(RECLAIM_NOTE))
            .await?;

        warn!(reclaimed, timeout_minutes = self.config.timeout_minutes, "Reclaimed stuck sync records");
        Ok(reclaimed)
    }

    /// 回収パスの後、未処理の記録を1ページ分処理する
    pub async fn run_main_pass(self: &Arc<Self>) -> Result<SyncPassReport> {
        let mut report = SyncPassReport {
            reclaimed: self.reclaim_stuck().await?,
            ..SyncPassReport::default()
        };

        let records = self
            .store
            .find_by_status_in(&SyncStatus::PENDING, self.config.page_limit)
            .await?;
        report.picked = records.len();
        if records.is_empty() {
            debug!("No sync records pending");
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for record in records {
            let reconciler = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let id = record.id.clone();
                match reconciler.process_record(record).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(record_id = %id, error = %e, "Sync record processing failed");
                        RecordOutcome::Failed
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.add(outcome),
                Err(e) => {
                    error!(error = %e, "Sync worker task failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            picked = report.picked,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            reclaimed = report.reclaimed,
            "Sync main pass completed"
        );
        Ok(report)
    }

    /// 再試行待機時間を過ぎた FAILED を RETRY_REQUIRED に戻す
    pub async fn escalate_failed(&self) -> Result<usize> {
        let threshold = self.clock.now() - ChronoDuration::minutes(self.config.retry_delay_minutes);
        let failed = self
            .store
            .find_failed_before(threshold, self.config.page_limit)
            .await?;
        if failed.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = failed.into_iter().map(|record| record.id).collect();
        let escalated = self.store.update_status(&ids, SyncStatus::RetryRequired, None).await?;
        info!(escalated, "Scheduled failed sync records for retry");
        Ok(escalated)
    }

    /// 状態ごとの件数をログに出す
    pub async fn log_statistics(&self) -> Result<HashMap<SyncStatus, usize>> {
        let counts = self.store.count_by_status().await?;
        let count = |status: SyncStatus| counts.get(&status).copied().unwrap_or(0);

        info!(
            not_synced = count(SyncStatus::NotSynced),
            in_progress = count(SyncStatus::InProgress),
            success = count(SyncStatus::Success),
            failed = count(SyncStatus::Failed),
            retry_required = count(SyncStatus::RetryRequired),
            "Sync record statistics"
        );
        Ok(counts)
    }

    /// 指定した記録を即座に同期する（管理操作）
    pub async fn sync_now(&self, record_id: &str) -> Result<RecordOutcome> {
        let record = self
            .store
            .find_by_id(record_id)
            .await?
            .ok_or_else(|| Error::Validation(format!("Sync record not found: {}", record_id)))?;

        if record.sync_status == SyncStatus::Success {
            self.store
                .update_status(&[record.id.clone()], SyncStatus::RetryRequired, Some("手動で再同期"))
                .await?;
        }

        info!(record_id, status = %record.sync_status, "Manual sync requested");
        self.process_record(record).await
    }

    /// 1件を確保して Jira に反映する
    pub async fn process_record(&self, record: SyncRecord) -> Result<RecordOutcome> {
        if record.remote_issue_key.trim().is_empty() {
            debug!(record_id = %record.id, "Sync record has no issue key, skipping");
            return Ok(RecordOutcome::Skipped);
        }

        let Some(mut claimed) = self.store.try_claim(&record.id, self.clock.now()).await? else {
            debug!(record_id = %record.id, "Sync record already claimed");
            return Ok(RecordOutcome::Skipped);
        };

        if !is_valid_issue_key(&claimed.remote_issue_key) {
            let message = format!("課題キーの形式が正しくありません: {}", claimed.remote_issue_key);
            return self.finish_failed(&mut claimed, message).await;
        }

        let credentials = match self.resolve_credentials(&claimed.actor_id).await {
            Ok(credentials) => credentials,
            Err(e) => return self.finish_failed(&mut claimed, e.to_string()).await,
        };

        match self
            .client
            .add_comment(&credentials, &claimed.remote_issue_key, &claimed.comment)
            .await
        {
            Ok(added) => {
                claimed.mark_success(Some(added.id), self.clock.now())?;
                self.store.save(&claimed).await?;
                info!(record_id = %claimed.id, issue_key = %claimed.remote_issue_key, "Sync record synced");
                Ok(RecordOutcome::Succeeded)
            }
            Err(e) => self.finish_failed(&mut claimed, e.to_string()).await,
        }
    }

    async fn finish_failed(&self, record: &mut SyncRecord, message: String) -> Result<RecordOutcome> {
        warn!(record_id = %record.id, issue_key = %record.remote_issue_key, error = %message, "Sync record failed");
        record.mark_failure(message, self.clock.now())?;
        self.store.save(record).await?;
        Ok(RecordOutcome::Failed)
    }

    async fn resolve_credentials(&self, actor_id: &str) -> Result<Credentials> {
        let stored = self
            .credentials
            .credentials_for(actor_id)
            .await?
            .ok_or_else(|| Error::ConfigurationMissing(format!("No Jira credentials for {}", actor_id)))?;

        let api_token = self.decryptor.decrypt(&stored.encrypted_api_token)?;
        Credentials::new(stored.server_url, stored.username, api_token)
    }

    /// メイン・再試行・統計の3つのループを開始
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Jira sync scheduler disabled");
            return Vec::new();
        }

        info!(
            main_interval_ms = self.config.main_interval_ms,
            retry_interval_ms = self.config.retry_interval_ms,
            report_interval_ms = self.config.report_interval_ms,
            "Jira sync scheduler started"
        );

        vec![
            self.spawn_loop("main", self.config.main_interval_ms, token.clone(), |reconciler| async move {
                reconciler.run_main_pass().await.map(|_| ())
            }),
            self.spawn_loop("retry", self.config.retry_interval_ms, token.clone(), |reconciler| async move {
                reconciler.escalate_failed().await.map(|_| ())
            }),
            self.spawn_loop("report", self.config.report_interval_ms, token, |reconciler| async move {
                reconciler.log_statistics().await.map(|_| ())
            }),
        ]
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, period_ms: u64, token: CancellationToken, pass: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let reconciler = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pass(Arc::clone(&reconciler)).await {
                            warn!(pass = name, error = %e, "Sync pass failed");
                        }
                    }
                }
            }
            debug!(pass = name, "Sync loop stopped");
        })
    }
}
