//! Jira 連携の監査ログ
//!
//! 呼び出し側はキューに積むだけで I/O を待たない。
//! 専用スレッドが1本だけキューを読み出し、ファイルに追記する。
//! キューが満杯のときは最も古いエントリを捨てる。

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::AuditConfig;
use crate::error::Result;

const WRITER_THREAD_NAME: &str = "jira-audit-log-writer";
const SYSTEM_ACTOR: &str = "SYSTEM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    ServiceStart,
    ServiceStop,
    ConnectionSuccess,
    ConnectionFailed,
    ApiCallSuccess,
    ApiCallFailed,
    CommentSuccess,
    CommentFailed,
    ProjectAccessSuccess,
    ProjectAccessFailed,
    ConfigChange,
    BatchSuccess,
    BatchFailed,
    SecurityEvent,
    PerformanceAlert,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ServiceStart => "SERVICE_START",
            AuditEventType::ServiceStop => "SERVICE_STOP",
            AuditEventType::ConnectionSuccess => "CONNECTION_SUCCESS",
            AuditEventType::ConnectionFailed => "CONNECTION_FAILED",
            AuditEventType::ApiCallSuccess => "API_CALL_SUCCESS",
            AuditEventType::ApiCallFailed => "API_CALL_FAILED",
            AuditEventType::CommentSuccess => "COMMENT_SUCCESS",
            AuditEventType::CommentFailed => "COMMENT_FAILED",
            AuditEventType::ProjectAccessSuccess => "PROJECT_ACCESS_SUCCESS",
            AuditEventType::ProjectAccessFailed => "PROJECT_ACCESS_FAILED",
            AuditEventType::ConfigChange => "CONFIG_CHANGE",
            AuditEventType::BatchSuccess => "BATCH_SUCCESS",
            AuditEventType::BatchFailed => "BATCH_FAILED",
            AuditEventType::SecurityEvent => "SECURITY_EVENT",
            AuditEventType::PerformanceAlert => "PERFORMANCE_ALERT",
        }
    }
}

/// 監査ログの1エントリ（作成後は変更しない）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub event_type: AuditEventType,
    pub message: String,
    pub resource_id: Option<String>,
    pub extra: Option<String>,
}

impl AuditLogEntry {
    /// `timestamp | actor | EVENT | message[ | Resource: r][ | Info: i]`
    pub fn format_line(&self) -> String {
        let mut line = format!(
            "{} | {} | {} | {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3f"),
            self.actor_id,
            self.event_type.as_str(),
            self.message
        );

        if let Some(resource_id) = &self.resource_id {
            line.push_str(" | Resource: ");
            line.push_str(resource_id);
        }
        if let Some(extra) = &self.extra {
            line.push_str(" | Info: ");
            line.push_str(extra);
        }
        line
    }
}

struct SharedQueue {
    entries: Mutex<VecDeque<AuditLogEntry>>,
    running: AtomicBool,
    dropped: AtomicU64,
    written: AtomicU64,
}

impl SharedQueue {
    fn pop(&self) -> Option<AuditLogEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }
}

struct WriterHandle {
    thread: thread::JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

pub struct AuditLogger {
    config: AuditConfig,
    clock: Arc<dyn Clock>,
    shared: Arc<SharedQueue>,
    writer: Mutex<Option<WriterHandle>>,
}

impl AuditLogger {
    pub fn new(config: AuditConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AuditConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            shared: Arc::new(SharedQueue {
                entries: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                written: AtomicU64::new(0),
            }),
            writer: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// 書き込みスレッドを起動
    ///
    /// ログファイルを開けない場合はエラーを返し、スレッドは起動しない。
    pub fn start(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Jira audit logging disabled");
            return Ok(());
        }

        let mut writer_slot = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if writer_slot.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.config.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.file_path)?;

        self.shared.running.store(true, Ordering::Release);
        self.log(AuditLogEntry {
            timestamp: self.clock.now(),
            actor_id: SYSTEM_ACTOR.to_string(),
            event_type: AuditEventType::ServiceStart,
            message: "Jira 監査ログサービス開始".to_string(),
            resource_id: None,
            extra: None,
        });

        let shared = Arc::clone(&self.shared);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let flush_interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        let (done_tx, done_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(WRITER_THREAD_NAME.to_string())
            .spawn(move || {
                run_writer(shared, BufWriter::new(file), poll_interval, flush_interval);
                let _ = done_tx.send(());
            })?;

        *writer_slot = Some(WriterHandle { thread, done: done_rx });
        info!(path = %self.config.file_path.display(), "Jira audit log writer started");
        Ok(())
    }

    /// キューに積む（ブロックしない）
    pub fn log(&self, entry: AuditLogEntry) {
        if !self.config.enabled {
            return;
        }

        let mut entries = self.shared.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.config.max_queue_size {
            entries.pop_front();
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if should_report_drop(dropped) {
                warn!(
                    max_queue_size = self.config.max_queue_size,
                    dropped,
                    "Audit log queue full, dropped oldest entry"
                );
            }
        }
        entries.push_back(entry);
    }

    /// キューを書き出してから書き込みスレッドを停止
    pub fn shutdown(&self) {
        let handle = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return;
        };

        self.event(SYSTEM_ACTOR, AuditEventType::ServiceStop, "Jira 監査ログサービス終了".to_string(), None, None);
        self.shared.running.store(false, Ordering::Release);

        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        match handle.done.recv_timeout(timeout) {
            Ok(()) => {
                if handle.thread.join().is_err() {
                    error!("Audit log writer thread panicked");
                }
                info!(
                    written = self.written_count(),
                    dropped = self.dropped_count(),
                    "Jira audit log writer stopped"
                );
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.shutdown_timeout_ms,
                    remaining = self.queue_len(),
                    "Audit log writer did not finish in time"
                );
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.shared.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn written_count(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }

    /// URLクエリ中のトークン・パスワード等を伏せる
    pub fn sanitize_url(&self, url: &str) -> String {
        if self.config.include_sensitive {
            url.to_string()
        } else {
            sanitize_url(url)
        }
    }

    pub fn log_connection_attempt(&self, actor: &str, server_url: &str, success: bool, detail: Option<&str>) {
        let (event_type, message) = if success {
            (AuditEventType::ConnectionSuccess, "Jira 接続成功")
        } else {
            (AuditEventType::ConnectionFailed, "Jira 接続失敗")
        };
        self.event(
            actor,
            event_type,
            message.to_string(),
            Some(self.sanitize_url(server_url)),
            detail.map(str::to_string),
        );
    }

    pub fn log_api_call(
        &self,
        actor: &str,
        operation: &str,
        endpoint: &str,
        success: bool,
        response_time_ms: u64,
        error_message: Option<&str>,
    ) {
        let endpoint = self.sanitize_url(endpoint);
        let mut message = format!(
            "API呼び出し - 操作: {}, エンドポイント: {}, 応答時間: {}ms",
            operation, endpoint, response_time_ms
        );
        if !success {
            if let Some(error_message) = error_message {
                message.push_str(&format!(", エラー: {}", error_message));
            }
        }

        let event_type = if success {
            AuditEventType::ApiCallSuccess
        } else {
            AuditEventType::ApiCallFailed
        };
        self.event(actor, event_type, message, Some(endpoint), error_message.map(str::to_string));
    }

    pub fn log_issue_comment(&self, actor: &str, issue_key: &str, success: bool, error_message: Option<&str>) {
        let (event_type, outcome) = if success {
            (AuditEventType::CommentSuccess, "追加成功")
        } else {
            (AuditEventType::CommentFailed, "追加失敗")
        };
        self.event(
            actor,
            event_type,
            format!("課題コメント{} - {}", outcome, issue_key),
            Some(issue_key.to_string()),
            error_message.map(str::to_string),
        );
    }

    pub fn log_project_access(&self, actor: &str, server_url: &str, project_count: usize, success: bool) {
        let (event_type, outcome) = if success {
            (AuditEventType::ProjectAccessSuccess, "成功")
        } else {
            (AuditEventType::ProjectAccessFailed, "失敗")
        };
        self.event(
            actor,
            event_type,
            format!("プロジェクト取得{} - {}件", outcome, project_count),
            Some(self.sanitize_url(server_url)),
            None,
        );
    }

    pub fn log_configuration_change(&self, actor: &str, action: &str, details: &str) {
        self.event(
            actor,
            AuditEventType::ConfigChange,
            format!("設定変更 - {}: {}", action, details),
            None,
            None,
        );
    }

    pub fn log_batch_operation(
        &self,
        actor: &str,
        operation_type: &str,
        item_count: usize,
        success: bool,
        execution_ms: u64,
    ) {
        let (event_type, outcome) = if success {
            (AuditEventType::BatchSuccess, "成功")
        } else {
            (AuditEventType::BatchFailed, "失敗")
        };
        self.event(
            actor,
            event_type,
            format!(
                "バッチ処理{} - 種別: {}, 件数: {}, 実行時間: {}ms",
                outcome, operation_type, item_count, execution_ms
            ),
            Some(operation_type.to_string()),
            None,
        );
    }

    pub fn log_security_event(&self, actor: Option<&str>, event: &str, description: &str, ip_address: Option<&str>) {
        let mut message = format!("セキュリティイベント - {}: {}", event, description);
        if let Some(ip) = ip_address {
            if self.config.include_sensitive {
                message.push_str(&format!(" (IP: {})", ip));
            }
        }
        self.event(
            actor.unwrap_or("ANONYMOUS"),
            AuditEventType::SecurityEvent,
            message,
            Some(event.to_string()),
            Some(description.to_string()),
        );
    }

    pub fn log_performance_alert(&self, metric: &str, threshold: f64, actual: f64, description: &str) {
        self.event(
            SYSTEM_ACTOR,
            AuditEventType::PerformanceAlert,
            format!(
                "性能警告 - {}: {:.2} (閾値: {:.2}) - {}",
                metric, actual, threshold, description
            ),
            Some(metric.to_string()),
            Some(description.to_string()),
        );
    }

    fn event(
        &self,
        actor: &str,
        event_type: AuditEventType,
        message: String,
        resource_id: Option<String>,
        extra: Option<String>,
    ) {
        let actor_id = if actor.trim().is_empty() { SYSTEM_ACTOR } else { actor };
        self.log(AuditLogEntry {
            timestamp: self.clock.now(),
            actor_id: actor_id.to_string(),
            event_type,
            message,
            resource_id,
            extra,
        });
    }
}

fn run_writer<W: Write>(
    shared: Arc<SharedQueue>,
    mut writer: W,
    poll_interval: Duration,
    flush_interval: Duration,
) {
    let mut last_flush = Instant::now();

    loop {
        match shared.pop() {
            Some(entry) => match writeln!(writer, "{}", entry.format_line()) {
                Ok(()) => {
                    shared.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => error!(error = %e, "Failed to write audit log entry"),
            },
            None => {
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(poll_interval);
            }
        }

        if last_flush.elapsed() >= flush_interval {
            if let Err(e) = writer.flush() {
                error!(error = %e, "Failed to flush audit log");
            }
            last_flush = Instant::now();
        }
    }

    if let Err(e) = writer.flush() {
        error!(error = %e, "Failed to flush audit log on shutdown");
    }
}

fn sensitive_query_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(token|password|key|secret)=[^&]*").expect("sensitive query pattern is valid")
    })
}

/// `token=...` などの値を `***` に置き換える
pub fn sanitize_url(url: &str) -> String {
    sensitive_query_pattern().replace_all(url, "$1=***").into_owned()
}

/// 破棄件数が 1, 2, 4, 8, ... に達したときだけ警告する
fn should_report_drop(dropped: u64) -> bool {
    dropped.is_power_of_two()
}
