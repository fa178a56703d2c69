//! Jira バッチ処理エンジン
//!
//! 作業項目を `batch_size` ごとのチャンクに分け、チャンク単位でワーカーに割り当てる。
//! 同時に動くチャンク数は `max_threads` で制限し、全操作で共有する。
//!
//! 操作全体の待機は `timeout_seconds` で打ち切る。打ち切られたチャンクは中断せずに
//! 最後まで動き続けるが、その時点で未処理の項目はタイムアウトとして数え、以降の結果は集計しない。
//!
//! 各チャンクの成功数・失敗数は1つの進捗ワードにまとめて記録する。項目の記録と封印が
//! 同じワードへの原子操作になるため、封印後の集計は必ず全項目を1回ずつ数える。

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::client::{ConnectionStatus, JiraClient};
use crate::clock::{Clock, SystemClock};
use crate::config::BatchConfig;
use crate::credentials::Credentials;
use crate::error::{Error, FailureKind, Result};
use crate::models::{AddedComment, Project};

/// チャンクの進捗ワードに立てる封印ビット
const SEALED: u64 = 1 << 63;
/// 進捗ワードの下位32ビットが成功数、その上が失敗数
const ERROR_UNIT: u64 = 1 << 32;
const SUCCESS_MASK: u64 = ERROR_UNIT - 1;

fn successes(word: u64) -> usize {
    (word & SUCCESS_MASK) as usize
}

fn failures(word: u64) -> usize {
    ((word & !SEALED) >> 32) as usize
}

/// 1つのバッチ操作の統計（ワーカーから並行に更新される）
#[derive(Debug)]
pub struct BatchOperationStats {
    operation_id: String,
    kind: String,
    total_items: usize,
    /// チャンクごとの進捗ワード
    chunks: Vec<Arc<AtomicU64>>,
    /// チャンクのタスク自体が失敗した項目数
    failed_count: AtomicUsize,
    timeout_count: AtomicUsize,
    started_at: DateTime<Utc>,
    completed_at: OnceLock<DateTime<Utc>>,
    cancel: CancellationToken,
}

impl BatchOperationStats {
    fn new(
        operation_id: String,
        kind: &str,
        total_items: usize,
        chunks: Vec<Arc<AtomicU64>>,
        started_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            operation_id,
            kind: kind.to_string(),
            total_items,
            chunks,
            failed_count: AtomicUsize::new(0),
            timeout_count: AtomicUsize::new(0),
            started_at,
            completed_at: OnceLock::new(),
            cancel,
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.get().is_some()
    }

    fn mark_completed(&self, at: DateTime<Utc>) {
        let _ = self.completed_at.set(at);
    }

    pub fn snapshot(&self) -> BatchStatsSnapshot {
        let completed_at = self.completed_at.get().copied();
        let (success_count, error_count) = self.chunks.iter().fold((0, 0), |(ok, err), chunk| {
            let word = chunk.load(Ordering::Acquire);
            (ok + successes(word), err + failures(word))
        });
        BatchStatsSnapshot {
            operation_id: self.operation_id.clone(),
            kind: self.kind.clone(),
            total_items: self.total_items,
            success_count,
            error_count: error_count + self.failed_count.load(Ordering::Acquire),
            timeout_count: self.timeout_count.load(Ordering::Acquire),
            started_at: self.started_at,
            completed_at,
            completed: completed_at.is_some(),
            cancelled: self.cancel.is_cancelled(),
            duration_ms: completed_at.map(|end| (end - self.started_at).num_milliseconds()),
        }
    }
}

/// バッチ統計のスナップショット
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchStatsSnapshot {
    pub operation_id: String,
    pub kind: String,
    pub total_items: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub timeout_count: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub cancelled: bool,
    pub duration_ms: Option<i64>,
}

/// 1項目の処理結果
#[derive(Debug)]
pub struct ItemOutcome<R> {
    /// 入力リスト内の位置
    pub index: usize,
    pub result: Result<R>,
}

/// バッチ操作の結果
///
/// `outcomes` には期限内に完了したチャンクの項目だけが入る。
#[derive(Debug)]
pub struct BatchResult<R> {
    pub operation_id: String,
    pub total_items: usize,
    pub chunk_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub timeout_count: usize,
    pub duration_ms: u64,
    pub outcomes: Vec<ItemOutcome<R>>,
}

impl<R> BatchResult<R> {
    pub fn is_complete_success(&self) -> bool {
        self.success_count == self.total_items
    }
}

/// コメント一括追加の1件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRequest {
    pub issue_key: String,
    pub text: String,
}

/// バッチ処理の概要（ヘルスチェック用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub active_operations: usize,
    pub completed_operations: usize,
    pub max_threads: usize,
    pub available_workers: usize,
}

struct ChunkHandle<R> {
    handle: JoinHandle<Vec<ItemOutcome<R>>>,
    progress: Arc<AtomicU64>,
    len: usize,
}

pub struct BatchProcessor {
    config: BatchConfig,
    client: Arc<JiraClient>,
    audit: Option<Arc<AuditLogger>>,
    clock: Arc<dyn Clock>,
    workers: Arc<Semaphore>,
    operations: RwLock<HashMap<String, Arc<BatchOperationStats>>>,
    shutdown: CancellationToken,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig, client: Arc<JiraClient>) -> Self {
        info!(
            max_threads = config.max_threads,
            batch_size = config.batch_size,
            timeout_seconds = config.timeout_seconds,
            "Jira batch processor initialised"
        );

        Self {
            workers: Arc::new(Semaphore::new(config.max_threads)),
            config,
            client,
            audit: None,
            clock: Arc::new(SystemClock),
            operations: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 項目をチャンクに分けて並行処理する
    ///
    /// 個々の項目やチャンクの失敗は集計に反映され、この関数自体は失敗しない。
    pub async fn submit<T, R, F, Fut>(&self, kind: &str, items: Vec<T>, work: F) -> BatchResult<R>
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.timeout_seconds);
        let operation_id = format!("{}_{}", kind, Uuid::new_v4());
        let total_items = items.len();
        let cancel = self.shutdown.child_token();

        let batch_size = self.config.batch_size.max(1);
        let mut pending = Vec::new();
        let mut items = items.into_iter().enumerate().peekable();
        while items.peek().is_some() {
            let chunk: Vec<(usize, T)> = items.by_ref().take(batch_size).collect();
            pending.push((chunk, Arc::new(AtomicU64::new(0))));
        }

        let stats = Arc::new(BatchOperationStats::new(
            operation_id.clone(),
            kind,
            total_items,
            pending.iter().map(|(_, progress)| Arc::clone(progress)).collect(),
            self.clock.now(),
            cancel.clone(),
        ));
        self.operations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation_id.clone(), Arc::clone(&stats));

        let work = Arc::new(work);
        let chunks: Vec<ChunkHandle<R>> = pending
            .into_iter()
            .map(|(chunk, progress)| {
                self.spawn_chunk(chunk, progress, Arc::clone(&work), &operation_id, cancel.clone())
            })
            .collect();
        let chunk_count = chunks.len();

        info!(
            operation_id = %operation_id,
            total_items,
            chunk_count,
            "Batch operation started"
        );

        let mut outcomes = Vec::with_capacity(total_items);
        for chunk in chunks {
            let ChunkHandle { mut handle, progress, len } = chunk;

            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(chunk_outcomes)) => outcomes.extend(chunk_outcomes),
                Ok(Err(join_error)) => {
                    let processed = seal(&progress);
                    stats.failed_count.fetch_add(len - processed, Ordering::AcqRel);
                    error!(
                        operation_id = %operation_id,
                        error = %join_error,
                        failed_items = len - processed,
                        "Batch chunk failed"
                    );
                }
                Err(_) => {
                    let processed = seal(&progress);
                    stats.timeout_count.fetch_add(len - processed, Ordering::AcqRel);
                    warn!(
                        operation_id = %operation_id,
                        timed_out_items = len - processed,
                        "Batch chunk timed out, remaining items will not be counted"
                    );
                }
            }
        }
        outcomes.sort_by_key(|outcome| outcome.index);

        stats.mark_completed(self.clock.now());
        let snapshot = stats.snapshot();
        let duration_ms = started.elapsed().as_millis() as u64;

        info!(
            operation_id = %operation_id,
            success = snapshot.success_count,
            errors = snapshot.error_count,
            timeouts = snapshot.timeout_count,
            duration_ms,
            "Batch operation completed"
        );

        if let Some(audit) = &self.audit {
            audit.log_batch_operation(
                "SYSTEM",
                kind,
                total_items,
                snapshot.error_count == 0 && snapshot.timeout_count == 0,
                duration_ms,
            );
        }

        BatchResult {
            operation_id,
            total_items,
            chunk_count,
            success_count: snapshot.success_count,
            error_count: snapshot.error_count,
            timeout_count: snapshot.timeout_count,
            duration_ms,
            outcomes,
        }
    }

    fn spawn_chunk<T, R, F, Fut>(
        &self,
        chunk: Vec<(usize, T)>,
        progress: Arc<AtomicU64>,
        work: Arc<F>,
        operation_id: &str,
        cancel: CancellationToken,
    ) -> ChunkHandle<R>
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let len = chunk.len();
        let operation_id = operation_id.to_string();
        let workers = Arc::clone(&self.workers);
        let max_attempts = self.config.max_retry_attempts.max(1);
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);
        let chunk_progress = Arc::clone(&progress);

        let handle = tokio::spawn(async move {
            let _permit = workers.acquire_owned().await.ok();
            let mut outcomes = Vec::with_capacity(len);

            for (index, item) in chunk {
                let result = if cancel.is_cancelled() {
                    Err(Error::Cancelled(format!("item {} skipped", index)))
                } else {
                    run_with_retry(work.as_ref(), item, max_attempts, retry_delay, &cancel).await
                };

                // 封印済みなら結果は捨てて、残りの項目の処理を続ける
                let unit = if result.is_ok() { 1 } else { ERROR_UNIT };
                let recorded = chunk_progress
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                        ((word & SEALED) == 0).then_some(word + unit)
                    })
                    .is_ok();
                if recorded {
                    outcomes.push(ItemOutcome { index, result });
                } else {
                    debug!(operation_id = %operation_id, index, "Discarding result of sealed chunk");
                }
            }
            outcomes
        });

        ChunkHandle { handle, progress, len }
    }

    /// コメントを一括追加
    pub async fn batch_add_comments(
        &self,
        credentials: Credentials,
        requests: Vec<CommentRequest>,
    ) -> BatchResult<AddedComment> {
        let client = Arc::clone(&self.client);
        let credentials = Arc::new(credentials);

        self.submit("batch_comment", requests, move |request: CommentRequest| {
            let client = Arc::clone(&client);
            let credentials = Arc::clone(&credentials);
            async move {
                client
                    .add_comment(&credentials, &request.issue_key, &request.text)
                    .await
            }
        })
        .await
    }

    /// 複数の接続情報をまとめて接続テスト
    pub async fn batch_test_connections(&self, targets: Vec<Credentials>) -> BatchResult<ConnectionStatus> {
        let client = Arc::clone(&self.client);

        self.submit("batch_connection_test", targets, move |credentials: Credentials| {
            let client = Arc::clone(&client);
            async move {
                let status = client.test_connection(&credentials, None).await;
                match (status.connected, status.failure) {
                    (true, _) => Ok(status),
                    (false, Some(FailureKind::Connectivity)) => Err(Error::Connectivity(status.message)),
                    (false, _) => Err(Error::Unexpected {
                        status: None,
                        message: status.message,
                    }),
                }
            }
        })
        .await
    }

    /// 接続情報ごとにプロジェクト一覧をまとめて取得
    pub async fn batch_get_projects(&self, targets: Vec<Credentials>) -> BatchResult<Vec<Project>> {
        let client = Arc::clone(&self.client);

        self.submit("batch_projects", targets, move |credentials: Credentials| {
            let client = Arc::clone(&client);
            async move { client.get_projects(&credentials).await }
        })
        .await
    }

    pub fn stats(&self, operation_id: &str) -> Option<BatchStatsSnapshot> {
        self.operations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(operation_id)
            .map(|stats| stats.snapshot())
    }

    pub fn all_stats(&self) -> Vec<BatchStatsSnapshot> {
        let mut all: Vec<BatchStatsSnapshot> = self
            .operations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|stats| stats.snapshot())
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    pub fn summary(&self) -> BatchSummary {
        let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
        let completed = operations.values().filter(|stats| stats.is_completed()).count();
        BatchSummary {
            active_operations: operations.len() - completed,
            completed_operations: completed,
            max_threads: self.config.max_threads,
            available_workers: self.workers.available_permits(),
        }
    }

    /// 実行中の操作を取り消す（未着手の項目と再試行待ちを中断）
    pub fn cancel(&self, operation_id: &str) -> bool {
        let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
        match operations.get(operation_id) {
            Some(stats) if !stats.is_completed() => {
                stats.cancel.cancel();
                info!(operation_id, "Batch operation cancelled");
                true
            }
            _ => false,
        }
    }

    /// 保持期間を過ぎた完了済み統計を削除
    pub fn cleanup_old_stats(&self) -> usize {
        let cutoff = self.clock.now() - ChronoDuration::hours(self.config.stats_retention_hours);
        let mut operations = self.operations.write().unwrap_or_else(|e| e.into_inner());
        let before = operations.len();
        operations.retain(|_, stats| stats.completed_at.get().is_none_or(|done| *done >= cutoff));
        let removed = before - operations.len();
        if removed > 0 {
            debug!(removed, "Removed old batch operation stats");
        }
        removed
    }

    pub fn start_cleanup(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        let period = Duration::from_millis(self.config.cleanup_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        processor.cleanup_old_stats();
                    }
                }
            }
        })
    }

    /// 全操作の再試行待ちを中断し、以降の項目を処理しない
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!("Jira batch processor shut down");
    }
}

/// 封印して、それまでに記録された件数を返す
fn seal(progress: &AtomicU64) -> usize {
    let word = progress.fetch_or(SEALED, Ordering::AcqRel);
    successes(word) + failures(word)
}

async fn run_with_retry<T, R, F, Fut>(
    work: &F,
    item: T,
    max_attempts: u32,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> Result<R>
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let mut attempt = 1;
    loop {
        match work(item.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                debug!(attempt, max_attempts, error = %e, "Retrying batch item");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(retry_delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, MonitorConfig, PoolConfig};
    use crate::connection_pool::ConnectionPool;
    use crate::monitor::HealthMonitor;
    use std::sync::atomic::AtomicU32;

    fn processor(config: BatchConfig) -> BatchProcessor {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), ClientConfig::default()));
        let monitor = Arc::new(HealthMonitor::new(MonitorConfig::default()));
        BatchProcessor::new(config, Arc::new(JiraClient::new(pool, monitor)))
    }

    #[tokio::test]
    async fn test_chunk_count_and_accounting() {
        // Given: 25件、バッチサイズ10
        let processor = processor(BatchConfig::default().retry_delay_ms(1));
        let items: Vec<u32> = (0..25).collect();

        // When: 偶数だけ成功する処理を流す
        let result = processor
            .submit("test", items, |n: u32| async move {
                if n % 2 == 0 {
                    Ok(n)
                } else {
                    Err(Error::Validation(format!("odd {}", n)))
                }
            })
            .await;

        // Then: ceil(25/10)=3 チャンク、全件が集計される
        assert_eq!(result.chunk_count, 3);
        assert_eq!(result.success_count, 13);
        assert_eq!(result.error_count, 12);
        assert_eq!(result.timeout_count, 0);
        assert_eq!(result.outcomes.len(), 25);
        assert!(result.outcomes.iter().enumerate().all(|(i, o)| o.index == i));

        let stats = processor.stats(&result.operation_id).unwrap();
        assert!(stats.completed);
        assert!(result.operation_id.starts_with("test_"));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        // Given: 2回失敗して3回目に成功する処理
        let processor = processor(BatchConfig::default().retry_delay_ms(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        // When: 1件だけ流す
        let result = processor
            .submit("retry", vec!["TEST-1".to_string()], move |_key: String| {
                let counter = Arc::clone(&counter);
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt < 3 {
                        Err(Error::Server {
                            status: 503,
                            message: "unavailable".to_string(),
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        // Then: 成功扱いで、ちょうど3回呼ばれる
        assert_eq!(result.success_count, 1);
        assert_eq!(result.error_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_tried_once() {
        let processor = processor(BatchConfig::default().retry_delay_ms(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = processor
            .submit("auth", vec![1], move |_n: i32| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::Authorization {
                        status: 401,
                        message: "bad token".to_string(),
                    })
                }
            })
            .await;

        assert_eq!(result.error_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_remaining_items_once() {
        // Given: 1秒で打ち切り、1チャンクが極端に遅い
        let config = BatchConfig::default().batch_size(2).timeout_seconds(1);
        let processor = processor(config);

        // When: 5件流す（3 は最初の項目なので、そのチャンク全体が間に合わない）
        let result = processor
            .submit("slow", vec![1u64, 2, 3, 4, 5], |n: u64| async move {
                if n == 3 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(n)
            })
            .await;

        // Then: 遅いチャンクの2件はタイムアウト、合計は5件
        assert_eq!(result.chunk_count, 3);
        assert_eq!(result.timeout_count, 2);
        assert_eq!(result.success_count, 3);
        assert_eq!(
            result.success_count + result.error_count + result.timeout_count,
            5
        );
        assert_eq!(result.outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_timed_out_chunk_keeps_running_in_background() {
        // Given: 2件のチャンクで、1件目が期限を超える
        let processor = processor(BatchConfig::default().batch_size(2).timeout_seconds(1));
        let later_calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&later_calls);

        // When: 期限切れの後もしばらく待つ
        let result = processor
            .submit("background", vec![1u32, 2], move |n: u32| {
                let counter = Arc::clone(&counter);
                async move {
                    if n == 1 {
                        tokio::time::sleep(Duration::from_millis(1_500)).await;
                    } else {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(n)
                }
            })
            .await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Then: 2件ともタイムアウト扱いだが、2件目も実行されている
        assert_eq!(result.timeout_count, 2);
        assert_eq!(result.success_count, 0);
        assert!(result.outcomes.is_empty());
        assert_eq!(later_calls.load(Ordering::SeqCst), 1);

        // 封印後の結果は統計にも入らない
        let stats = processor.stats(&result.operation_id).unwrap();
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.timeout_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_item_counted_exactly_once_at_deadline() {
        // Given: 期限付近で終わる項目が多数あるチャンク
        let processor = processor(BatchConfig::default().batch_size(4).max_threads(16).timeout_seconds(1));
        let items: Vec<u64> = (0..64).collect();

        // When: 各項目が少しずつずれて終わる
        let result = processor
            .submit("deadline", items, |n: u64| async move {
                tokio::time::sleep(Duration::from_millis(240 + (n % 4) * 10)).await;
                if n % 5 == 0 {
                    Err(Error::Validation(format!("rejected {}", n)))
                } else {
                    Ok(n)
                }
            })
            .await;

        // Then: 成功・失敗・タイムアウトの合計は常に全件数
        assert_eq!(
            result.success_count + result.error_count + result.timeout_count,
            64
        );
        assert_eq!(result.outcomes.len(), result.success_count + result.error_count);
    }

    #[test]
    fn test_seal_freezes_recorded_counts() {
        let progress = AtomicU64::new(0);
        progress.fetch_add(1, Ordering::AcqRel);
        progress.fetch_add(ERROR_UNIT, Ordering::AcqRel);
        progress.fetch_add(1, Ordering::AcqRel);

        assert_eq!(seal(&progress), 3);
        let word = progress.load(Ordering::Acquire);
        assert_eq!(successes(word), 2);
        assert_eq!(failures(word), 1);
    }

    #[tokio::test]
    async fn test_panicking_chunk_counts_as_errors() {
        let processor = processor(BatchConfig::default().batch_size(3));

        let result = processor
            .submit("panic", vec![1, 2, 3, 4], |n: i32| async move {
                if n == 4 {
                    panic!("worker exploded");
                }
                Ok(n)
            })
            .await;

        assert_eq!(result.success_count, 3);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_submission() {
        let processor = processor(BatchConfig::default());

        let result = processor
            .submit("empty", Vec::<u8>::new(), |n: u8| async move { Ok(n) })
            .await;

        assert_eq!(result.chunk_count, 0);
        assert_eq!(result.total_items, 0);
        assert!(result.is_complete_success());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_retry_backoff() {
        // Given: 再試行間隔が長い処理
        let processor = Arc::new(processor(
            BatchConfig::default().retry_delay_ms(60_000).timeout_seconds(120),
        ));
        let runner = Arc::clone(&processor);

        // When: 実行中にシャットダウン
        let task = tokio::spawn(async move {
            runner
                .submit("backoff", vec![1], |_n: i32| async move {
                    Err::<(), _>(Error::Connectivity("refused".to_string()))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        processor.shutdown();

        // Then: 長い待機を待たずにエラーとして終わる
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("batch should stop promptly")
            .unwrap();
        assert_eq!(result.error_count, 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_stats() {
        let processor = processor(BatchConfig::default());
        let result = processor
            .submit("cleanup", vec![1], |n: i32| async move { Ok(n) })
            .await;

        assert_eq!(processor.cleanup_old_stats(), 0);
        assert!(processor.stats(&result.operation_id).is_some());
        assert_eq!(processor.summary().completed_operations, 1);
        assert!(!processor.cancel(&result.operation_id));
    }
}
