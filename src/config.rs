use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// 連携レイヤー全体の設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IntegrationConfig {
    pub pool: PoolConfig,
    pub client: ClientConfig,
    pub batch: BatchConfig,
    pub scheduler: SchedulerConfig,
    pub audit: AuditConfig,
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
}

/// 接続プールの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 最大接続数
    pub max_connections: usize,
    /// アイドルタイムアウト（ミリ秒）
    pub idle_timeout_ms: u64,
    /// 定期クリーンアップ間隔（ミリ秒）
    pub cleanup_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            idle_timeout_ms: 300_000, // 5分
            cleanup_interval_ms: 60_000,
        }
    }
}

impl PoolConfig {
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn cleanup_interval_ms(mut self, ms: u64) -> Self {
        self.cleanup_interval_ms = ms;
        self
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }
}

/// HTTPクライアントの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "TestCaseManager/1.0".to_string(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

/// バッチ処理の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// ワーカー数
    pub max_threads: usize,
    /// 1バッチあたりの件数
    pub batch_size: usize,
    /// 操作全体の待機上限（秒）
    pub timeout_seconds: u64,
    /// 1件あたりの最大試行回数
    pub max_retry_attempts: u32,
    /// 再試行間隔（ミリ秒、固定）
    pub retry_delay_ms: u64,
    /// 完了済み統計の保持時間
    pub stats_retention_hours: i64,
    /// 統計クリーンアップ間隔（ミリ秒）
    pub cleanup_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_threads: 5,
            batch_size: 10,
            timeout_seconds: 30,
            max_retry_attempts: 3,
            retry_delay_ms: 2_000,
            stats_retention_hours: 24,
            cleanup_interval_ms: 3_600_000,
        }
    }
}

impl BatchConfig {
    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn max_retry_attempts(mut self, n: u32) -> Self {
        self.max_retry_attempts = n;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay_ms = ms;
        self
    }

    pub fn cleanup_interval_ms(mut self, ms: u64) -> Self {
        self.cleanup_interval_ms = ms;
        self
    }
}

/// 同期スケジューラの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 1回のスキャンで取得する最大件数
    pub page_limit: usize,
    /// FAILED を RETRY_REQUIRED に戻すまでの待機（分）
    pub retry_delay_minutes: i64,
    /// IN_PROGRESS のまま放置された記録を回収するまでの時間（分）
    pub timeout_minutes: i64,
    /// 同時処理数
    pub max_concurrent: usize,
    pub main_interval_ms: u64,
    pub retry_interval_ms: u64,
    pub report_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            page_limit: 20,
            retry_delay_minutes: 30,
            timeout_minutes: 30,
            max_concurrent: 5,
            main_interval_ms: 300_000,    // 5分
            retry_interval_ms: 1_800_000, // 30分
            report_interval_ms: 3_600_000, // 1時間
        }
    }
}

impl SchedulerConfig {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn page_limit(mut self, n: usize) -> Self {
        self.page_limit = n;
        self
    }

    pub fn timeout_minutes(mut self, minutes: i64) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub fn retry_delay_minutes(mut self, minutes: i64) -> Self {
        self.retry_delay_minutes = minutes;
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }
}

/// 監査ログの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub file_path: PathBuf,
    pub max_queue_size: usize,
    pub flush_interval_ms: u64,
    /// キューが空のときの待機間隔
    pub poll_interval_ms: u64,
    pub include_sensitive: bool,
    pub shutdown_timeout_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_path: PathBuf::from("./logs/jira-audit.log"),
            max_queue_size: 1_000,
            flush_interval_ms: 10_000,
            poll_interval_ms: 100,
            include_sensitive: false,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl AuditConfig {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = path.into();
        self
    }

    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }
}

/// 監視の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub metric_retention_hours: i64,
    pub cleanup_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metric_retention_hours: 72,
            cleanup_interval_ms: 3_600_000,
        }
    }
}

/// 診断ログの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// RUST_LOG 未設定時のフィルター
    pub default_filter: String,
    pub log_dir: Option<PathBuf>,
    pub log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            log_dir: None,
            log_file: "jira-integration.log".to_string(),
        }
    }
}

impl IntegrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn audit(mut self, audit: AuditConfig) -> Self {
        self.audit = audit;
        self
    }

    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// 既定の設定ファイルパス（`<config_dir>/jira-integration/config.json`）
    pub fn default_config_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::ConfigurationMissing("設定ディレクトリが見つかりません".to_string()))?;
        Ok(dir.join("jira-integration").join("config.json"))
    }

    /// JSONファイルから読み込み（存在しない場合は None）
    pub async fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let mut file = fs::File::open(path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        if contents.trim().is_empty() {
            return Ok(None);
        }

        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(Some(config))
    }

    /// JSONファイルへ保存
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// 既定値に環境変数（.env を含む）を重ねて作成
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// 環境変数で上書き
    pub fn apply_env(&mut self) -> Result<()> {
        env_override("JIRA_POOL_MAX_CONNECTIONS", &mut self.pool.max_connections)?;
        env_override("JIRA_POOL_IDLE_TIMEOUT_MS", &mut self.pool.idle_timeout_ms)?;
        env_override("JIRA_POOL_CLEANUP_INTERVAL_MS", &mut self.pool.cleanup_interval_ms)?;

        env_override("JIRA_CLIENT_USER_AGENT", &mut self.client.user_agent)?;
        env_override("JIRA_CLIENT_CONNECT_TIMEOUT_MS", &mut self.client.connect_timeout_ms)?;
        env_override("JIRA_CLIENT_REQUEST_TIMEOUT_MS", &mut self.client.request_timeout_ms)?;

        env_override("JIRA_BATCH_MAX_THREADS", &mut self.batch.max_threads)?;
        env_override("JIRA_BATCH_SIZE", &mut self.batch.batch_size)?;
        env_override("JIRA_BATCH_TIMEOUT_SECONDS", &mut self.batch.timeout_seconds)?;
        env_override("JIRA_BATCH_RETRY_ATTEMPTS", &mut self.batch.max_retry_attempts)?;
        env_override("JIRA_BATCH_RETRY_DELAY_MS", &mut self.batch.retry_delay_ms)?;
        env_override("JIRA_BATCH_CLEANUP_INTERVAL_MS", &mut self.batch.cleanup_interval_ms)?;

        env_override("JIRA_SCHEDULER_ENABLED", &mut self.scheduler.enabled)?;
        env_override("JIRA_SCHEDULER_PAGE_LIMIT", &mut self.scheduler.page_limit)?;
        env_override("JIRA_SCHEDULER_RETRY_DELAY_MINUTES", &mut self.scheduler.retry_delay_minutes)?;
        env_override("JIRA_SCHEDULER_TIMEOUT_MINUTES", &mut self.scheduler.timeout_minutes)?;
        env_override("JIRA_SCHEDULER_MAX_CONCURRENT", &mut self.scheduler.max_concurrent)?;
        env_override("JIRA_SCHEDULER_MAIN_INTERVAL_MS", &mut self.scheduler.main_interval_ms)?;
        env_override("JIRA_SCHEDULER_RETRY_INTERVAL_MS", &mut self.scheduler.retry_interval_ms)?;
        env_override("JIRA_SCHEDULER_REPORT_INTERVAL_MS", &mut self.scheduler.report_interval_ms)?;

        env_override("JIRA_AUDIT_ENABLED", &mut self.audit.enabled)?;
        env_override("JIRA_AUDIT_FILE_PATH", &mut self.audit.file_path)?;
        env_override("JIRA_AUDIT_MAX_QUEUE_SIZE", &mut self.audit.max_queue_size)?;
        env_override("JIRA_AUDIT_FLUSH_INTERVAL_MS", &mut self.audit.flush_interval_ms)?;
        env_override("JIRA_AUDIT_POLL_INTERVAL_MS", &mut self.audit.poll_interval_ms)?;
        env_override("JIRA_AUDIT_INCLUDE_SENSITIVE", &mut self.audit.include_sensitive)?;

        env_override("JIRA_MONITOR_ENABLED", &mut self.monitor.enabled)?;
        env_override("JIRA_MONITOR_RETENTION_HOURS", &mut self.monitor.metric_retention_hours)?;
        env_override("JIRA_MONITOR_CLEANUP_INTERVAL_MS", &mut self.monitor.cleanup_interval_ms)?;

        env_override("JIRA_LOG_FILTER", &mut self.logging.default_filter)?;
        Ok(())
    }

    /// 値の妥当性チェック
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 19] = [
            ("pool.max_connections", self.pool.max_connections > 0),
            ("pool.idle_timeout_ms", self.pool.idle_timeout_ms > 0),
            ("pool.cleanup_interval_ms", self.pool.cleanup_interval_ms > 0),
            ("batch.max_threads", self.batch.max_threads > 0),
            ("batch.batch_size", self.batch.batch_size > 0),
            ("batch.timeout_seconds", self.batch.timeout_seconds > 0),
            ("batch.max_retry_attempts", self.batch.max_retry_attempts > 0),
            ("batch.cleanup_interval_ms", self.batch.cleanup_interval_ms > 0),
            ("scheduler.page_limit", self.scheduler.page_limit > 0),
            ("scheduler.max_concurrent", self.scheduler.max_concurrent > 0),
            ("scheduler.timeout_minutes", self.scheduler.timeout_minutes > 0),
            ("scheduler.main_interval_ms", self.scheduler.main_interval_ms > 0),
            ("scheduler.retry_interval_ms", self.scheduler.retry_interval_ms > 0),
            ("scheduler.report_interval_ms", self.scheduler.report_interval_ms > 0),
            ("audit.max_queue_size", self.audit.max_queue_size > 0),
            ("audit.flush_interval_ms", self.audit.flush_interval_ms > 0),
            ("audit.poll_interval_ms", self.audit.poll_interval_ms > 0),
            ("monitor.metric_retention_hours", self.monitor.metric_retention_hours > 0),
            ("monitor.cleanup_interval_ms", self.monitor.cleanup_interval_ms > 0),
        ];

        for (name, ok) in checks {
            if !ok {
                return Err(Error::Configuration(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}

fn env_override<T: FromStr>(name: &str, target: &mut T) -> Result<()> {
    match std::env::var(name) {
        Ok(raw) => {
            *target = raw
                .trim()
                .parse()
                .map_err(|_| Error::Configuration(format!("{} has an invalid value: {}", name, raw)))?;
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // 環境変数を触るテストは直列に実行する
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_follow_service_properties() {
        // Given/When: 既定値で作成
        let config = IntegrationConfig::default();

        // Then: 既定のプロパティ値と一致する
        assert_eq!(config.pool.max_connections, 20);
        assert_eq!(config.pool.idle_timeout_ms, 300_000);
        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.max_threads, 5);
        assert_eq!(config.batch.max_retry_attempts, 3);
        assert_eq!(config.scheduler.page_limit, 20);
        assert_eq!(config.audit.max_queue_size, 1_000);
        assert_eq!(config.monitor.metric_retention_hours, 72);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        // Given: バッチサイズ0
        let config = IntegrationConfig::new().batch(BatchConfig::default().batch_size(0));

        // When: 検証
        let result = config.validate();

        // Then: 設定エラー
        match result {
            Err(Error::Configuration(msg)) => assert!(msg.contains("batch.batch_size")),
            other => panic!("Expected Configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_apply_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        // Given: 環境変数を設定
        unsafe {
            std::env::set_var("JIRA_POOL_MAX_CONNECTIONS", "7");
            std::env::set_var("JIRA_BATCH_RETRY_DELAY_MS", "15");
        }

        // When: 環境変数を適用
        let mut config = IntegrationConfig::default();
        let result = config.apply_env();

        // Then: 値が上書きされる
        assert!(result.is_ok());
        assert_eq!(config.pool.max_connections, 7);
        assert_eq!(config.batch.retry_delay_ms, 15);

        // Cleanup
        unsafe {
            std::env::remove_var("JIRA_POOL_MAX_CONNECTIONS");
            std::env::remove_var("JIRA_BATCH_RETRY_DELAY_MS");
        }
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        // Given: 周期を0にした各設定
        let mut zero_main = IntegrationConfig::default();
        zero_main.scheduler.main_interval_ms = 0;
        let mut zero_retry = IntegrationConfig::default();
        zero_retry.scheduler.retry_interval_ms = 0;
        let mut zero_report = IntegrationConfig::default();
        zero_report.scheduler.report_interval_ms = 0;
        let mut zero_monitor = IntegrationConfig::default();
        zero_monitor.monitor.cleanup_interval_ms = 0;
        let zero_batch = IntegrationConfig::default().batch(BatchConfig::default().cleanup_interval_ms(0));
        let zero_poll = IntegrationConfig::default().audit(AuditConfig::default().poll_interval_ms(0));
        let zero_flush = IntegrationConfig::default().audit(AuditConfig::default().flush_interval_ms(0));

        let cases = [
            (zero_main, "scheduler.main_interval_ms"),
            (zero_retry, "scheduler.retry_interval_ms"),
            (zero_report, "scheduler.report_interval_ms"),
            (zero_monitor, "monitor.cleanup_interval_ms"),
            (zero_batch, "batch.cleanup_interval_ms"),
            (zero_poll, "audit.poll_interval_ms"),
            (zero_flush, "audit.flush_interval_ms"),
        ];

        // When/Then: どれも該当項目を示す設定エラー
        for (config, field) in cases {
            match config.validate() {
                Err(Error::Configuration(msg)) => assert!(msg.contains(field), "{}: {}", field, msg),
                other => panic!("Expected Configuration error for {}, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_apply_env_cleanup_intervals() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        // Given: 後片付けの周期を環境変数で指定
        unsafe {
            std::env::set_var("JIRA_BATCH_CLEANUP_INTERVAL_MS", "120000");
            std::env::set_var("JIRA_MONITOR_CLEANUP_INTERVAL_MS", "90000");
            std::env::set_var("JIRA_AUDIT_POLL_INTERVAL_MS", "50");
        }

        // When: 環境変数を適用
        let mut config = IntegrationConfig::default();
        let result = config.apply_env();

        // Then: 値が上書きされる
        assert!(result.is_ok());
        assert_eq!(config.batch.cleanup_interval_ms, 120_000);
        assert_eq!(config.monitor.cleanup_interval_ms, 90_000);
        assert_eq!(config.audit.poll_interval_ms, 50);

        unsafe {
            std::env::remove_var("JIRA_BATCH_CLEANUP_INTERVAL_MS");
            std::env::remove_var("JIRA_MONITOR_CLEANUP_INTERVAL_MS");
            std::env::remove_var("JIRA_AUDIT_POLL_INTERVAL_MS");
        }
    }

    #[test]
    fn test_apply_env_invalid_value() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        // Given: 数値でない値
        unsafe {
            std::env::set_var("JIRA_AUDIT_MAX_QUEUE_SIZE", "many");
        }

        // When: 環境変数を適用
        let mut config = IntegrationConfig::default();
        let result = config.apply_env();

        // Then: 設定エラー
        assert!(matches!(result, Err(Error::Configuration(_))));

        unsafe {
            std::env::remove_var("JIRA_AUDIT_MAX_QUEUE_SIZE");
        }
    }

    #[tokio::test]
    async fn test_save_and_load_file() {
        // Given: 一部を変更した設定
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.json");
        let config = IntegrationConfig::new().pool(PoolConfig::default().max_connections(3));

        // When: 保存して読み込む
        config.save_to_file(&path).await.unwrap();
        let loaded = IntegrationConfig::load_from_file(&path).await.unwrap();

        // Then: 値が保持される
        let loaded = loaded.expect("config should exist");
        assert_eq!(loaded.pool.max_connections, 3);
        assert_eq!(loaded.batch.batch_size, 10);
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_none() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = IntegrationConfig::load_from_file(&temp_dir.path().join("none.json"))
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        // Given: poolだけを含むJSON
        let json = r#"{ "pool": { "max_connections": 2 } }"#;

        // When: デシリアライズ
        let config: IntegrationConfig = serde_json::from_str(json).unwrap();

        // Then: 指定外は既定値
        assert_eq!(config.pool.max_connections, 2);
        assert_eq!(config.pool.idle_timeout_ms, 300_000);
        assert_eq!(config.scheduler.timeout_minutes, 30);
    }
}
