//! Jira 連携の健全性モニター
//!
//! API 呼び出しの成否とレイテンシを累積し、時間単位のバケットに集計する。
//! 健全性の判定にはヒステリシスを用いる：
//! - 10回以上の呼び出しで成功率 90% 以上 → 正常
//! - 20回以上の呼び出しで成功率 70% 未満 → 異常
//! - その間は直前の判定を維持する

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::config::MonitorConfig;

const HEALTHY_RATE: f64 = 90.0;
const HEALTHY_MIN_CALLS: u64 = 10;
const UNHEALTHY_RATE: f64 = 70.0;
const UNHEALTHY_MIN_CALLS: u64 = 20;
const REPORT_HOURS: usize = 24;

/// 1時間分の集計バケット
#[derive(Debug)]
pub struct HourlyMetricsBucket {
    hour: DateTime<Utc>,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    total_latency_ms: AtomicU64,
    error_count: AtomicU64,
}

impl HourlyMetricsBucket {
    fn new(hour: DateTime<Utc>) -> Self {
        Self {
            hour,
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    fn add_call(&self, success: bool, latency_ms: u64) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn increment_errors(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) -> HourlyReport {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let successful_calls = self.successful_calls.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        HourlyReport {
            hour_key: hour_key(self.hour),
            hour: self.hour,
            total_calls,
            successful_calls,
            error_count: self.error_count.load(Ordering::Relaxed),
            success_rate: rate(successful_calls, total_calls),
            average_latency_ms: if total_calls > 0 { total_latency / total_calls } else { 0 },
        }
    }
}

/// 時間別メトリクスのスナップショット
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HourlyReport {
    /// `YYYY-MM-DD-HH`
    pub hour_key: String,
    pub hour: DateTime<Utc>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub error_count: u64,
    pub success_rate: f64,
    pub average_latency_ms: u64,
}

/// システム全体のメトリクス
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub monitoring_enabled: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub system_healthy: bool,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub success_rate: f64,
    pub average_latency_ms: u64,
    pub last_error: Option<String>,
    pub hourly_metrics_count: usize,
}

impl SystemMetrics {
    fn disabled() -> Self {
        Self {
            monitoring_enabled: false,
            last_health_check: None,
            system_healthy: true,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            success_rate: 0.0,
            average_latency_ms: 0,
            last_error: None,
            hourly_metrics_count: 0,
        }
    }
}

/// ヘルスチェック結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub up: bool,
    pub details: BTreeMap<String, serde_json::Value>,
}

impl HealthStatus {
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

pub struct HealthMonitor {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    total_latency_ms: AtomicU64,
    healthy: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
    hourly: RwLock<BTreeMap<DateTime<Utc>, Arc<HourlyMetricsBucket>>>,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        if config.enabled {
            info!(retention_hours = config.metric_retention_hours, "Jira health monitor initialised");
        } else {
            info!("Jira health monitor disabled");
        }

        Self {
            config,
            clock,
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            last_error: Mutex::new(None),
            last_health_check: Mutex::new(None),
            hourly: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// API 呼び出し結果を記録
    pub fn record_call(&self, success: bool, latency_ms: u64) {
        if !self.config.enabled {
            return;
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }

        self.current_bucket().add_call(success, latency_ms);
        self.update_health();
    }

    /// 明示的なエラーを記録（即座に異常扱い）
    pub fn record_error(&self, message: impl Into<String>) {
        if !self.config.enabled {
            return;
        }

        let message = message.into();
        error!(error = %message, "Jira system error recorded");

        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
        self.healthy.store(false, Ordering::Release);
        self.current_bucket().increment_errors();
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn success_rate(&self) -> f64 {
        rate(
            self.successful_calls.load(Ordering::Relaxed),
            self.total_calls.load(Ordering::Relaxed),
        )
    }

    pub fn average_latency_ms(&self) -> u64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        if total > 0 {
            self.total_latency_ms.load(Ordering::Relaxed) / total
        } else {
            0
        }
    }

    /// 現時点のメトリクス
    pub fn snapshot(&self) -> SystemMetrics {
        if !self.config.enabled {
            return SystemMetrics::disabled();
        }

        SystemMetrics {
            monitoring_enabled: true,
            last_health_check: *self.last_health_check.lock().unwrap_or_else(|e| e.into_inner()),
            system_healthy: self.is_healthy(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            success_rate: self.success_rate(),
            average_latency_ms: self.average_latency_ms(),
            last_error: self.last_error(),
            hourly_metrics_count: self.hourly.read().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }

    /// 保持期間内の時間別メトリクス（新しい順）
    pub fn hourly_metrics(&self) -> Vec<HourlyReport> {
        self.cleanup_old_metrics();
        let hourly = self.hourly.read().unwrap_or_else(|e| e.into_inner());
        hourly.values().rev().map(|bucket| bucket.report()).collect()
    }

    /// 保持期間を過ぎたバケットを削除し、削除数を返す
    pub fn cleanup_old_metrics(&self) -> usize {
        let cutoff = hour_start(self.clock.now() - Duration::hours(self.config.metric_retention_hours));
        let mut hourly = self.hourly.write().unwrap_or_else(|e| e.into_inner());
        let before = hourly.len();
        hourly.retain(|hour, _| *hour >= cutoff);
        before - hourly.len()
    }

    /// 定期的な古いバケットの削除を開始
    pub fn start_cleanup(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = std::time::Duration::from_millis(self.config.cleanup_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = monitor.cleanup_old_metrics();
                        if removed > 0 {
                            debug!(removed, "Removed expired hourly metrics");
                        }
                    }
                }
            }
        })
    }

    /// 全カウンターをリセット（運用復旧用）
    pub fn reset(&self) {
        if !self.config.enabled {
            return;
        }

        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.total_latency_ms.store(0, Ordering::Relaxed);
        self.hourly.write().unwrap_or_else(|e| e.into_inner()).clear();
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.healthy.store(true, Ordering::Release);

        info!("Jira monitoring metrics reset");
    }

    /// ヘルスチェック結果（接続プール・バッチの詳細は呼び出し側で追加）
    pub fn health(&self) -> HealthStatus {
        if !self.config.enabled {
            return HealthStatus {
                up: true,
                details: BTreeMap::new(),
            }
            .with_detail("monitoring", "disabled");
        }

        let metrics = self.snapshot();
        let mut status = HealthStatus {
            up: metrics.system_healthy,
            details: BTreeMap::new(),
        }
        .with_detail("totalApiCalls", metrics.total_calls)
        .with_detail("successfulApiCalls", metrics.successful_calls)
        .with_detail("failedApiCalls", metrics.failed_calls)
        .with_detail("successRate", metrics.success_rate)
        .with_detail("averageResponseTime", metrics.average_latency_ms);

        if let Some(checked) = metrics.last_health_check {
            status = status.with_detail("lastHealthCheck", checked.to_rfc3339());
        }
        if let Some(last_error) = metrics.last_error {
            status = status.with_detail("lastError", last_error);
        }
        status
    }

    /// 人が読むためのレポート
    pub fn report(&self) -> String {
        if !self.config.enabled {
            return "Jira モニタリングは無効です。".to_string();
        }

        let metrics = self.snapshot();
        let mut report = String::new();

        report.push_str("=== Jira システムモニタリングレポート ===\n");
        report.push_str(&format!("生成時刻: {}\n", self.clock.now().format("%Y-%m-%dT%H:%M:%S")));
        report.push_str(&format!(
            "システム状態: {}\n",
            if metrics.system_healthy { "正常" } else { "警告" }
        ));
        report.push_str(&format!("API呼び出し総数: {}回\n", metrics.total_calls));
        report.push_str(&format!("成功率: {:.2}%\n", metrics.success_rate));
        report.push_str(&format!("平均応答時間: {} ms\n", metrics.average_latency_ms));

        if let Some(last_error) = &metrics.last_error {
            report.push_str(&format!("最後のエラー: {}\n", last_error));
        }

        let hourly = self.hourly_metrics();
        if !hourly.is_empty() {
            report.push_str(&format!("\n=== 時間別統計（直近{}時間） ===\n", REPORT_HOURS));
            for hour in hourly.iter().take(REPORT_HOURS) {
                report.push_str(&format!(
                    "{}: 呼び出し {}回, 成功率 {:.1}%, 平均応答 {}ms\n",
                    hour.hour_key, hour.total_calls, hour.success_rate, hour.average_latency_ms
                ));
            }
        }

        report.push_str("=================================");
        report
    }

    fn current_bucket(&self) -> Arc<HourlyMetricsBucket> {
        let hour = hour_start(self.clock.now());

        if let Some(bucket) = self.hourly.read().unwrap_or_else(|e| e.into_inner()).get(&hour) {
            return Arc::clone(bucket);
        }

        let mut hourly = self.hourly.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            hourly
                .entry(hour)
                .or_insert_with(|| Arc::new(HourlyMetricsBucket::new(hour))),
        )
    }

    fn update_health(&self) {
        *self.last_health_check.lock().unwrap_or_else(|e| e.into_inner()) = Some(self.clock.now());

        let total = self.total_calls.load(Ordering::Relaxed);
        let success_rate = self.success_rate();

        // 健全判定は直前の record_error より優先する
        if total >= HEALTHY_MIN_CALLS && success_rate >= HEALTHY_RATE {
            self.healthy.store(true, Ordering::Release);
            *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
        } else if total >= UNHEALTHY_MIN_CALLS && success_rate < UNHEALTHY_RATE {
            self.healthy.store(false, Ordering::Release);
        }
    }
}

fn rate(part: u64, total: u64) -> f64 {
    if total > 0 {
        part as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

fn hour_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::hours(1)).unwrap_or(at)
}

fn hour_key(hour: DateTime<Utc>) -> String {
    hour.format("%Y-%m-%d-%H").to_string()
}
