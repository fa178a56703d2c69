//! サーバー単位の HTTP クライアントプール
//!
//! 正規化したサーバーURLごとに `reqwest::Client` を1つキャッシュする。
//! 上限に達した場合はアイドル掃除を行い、それでも空きがなければ最も古く使われた接続を追い出す。

use chrono::{DateTime, Utc};
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ClientConfig, PoolConfig};
use crate::credentials::connection_key;
use crate::error::{Error, Result};

/// プールされた接続
#[derive(Debug)]
pub struct PooledConnection {
    id: u64,
    key: String,
    client: Client,
    created_at: DateTime<Utc>,
    last_used_ms: AtomicI64,
}

impl PooledConnection {
    /// プール内で一意な接続ID
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.last_used_ms.store(now.timestamp_millis(), Ordering::Release);
    }

    fn last_used_ms(&self) -> i64 {
        self.last_used_ms.load(Ordering::Acquire)
    }

    fn is_idle(&self, now: DateTime<Utc>, idle_timeout_ms: u64) -> bool {
        now.timestamp_millis() - self.last_used_ms() > idle_timeout_ms as i64
    }
}

/// 接続プールの統計
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionPoolStats {
    pub max_connections: usize,
    pub active_connections: usize,
    pub cached_connections: usize,
    pub total_created: u64,
    pub total_reused: u64,
    pub total_evicted: u64,
    pub idle_timeout_ms: u64,
}

impl ConnectionPoolStats {
    /// 再利用率（%）
    pub fn reuse_rate(&self) -> f64 {
        let total = self.total_created + self.total_reused;
        if total > 0 {
            self.total_reused as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    client_config: ClientConfig,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, Arc<PooledConnection>>>,
    creation_lock: Mutex<()>,
    next_id: AtomicU64,
    active_connections: AtomicUsize,
    total_created: AtomicU64,
    total_reused: AtomicU64,
    total_evicted: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, client_config: ClientConfig) -> Self {
        Self::with_clock(config, client_config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PoolConfig, client_config: ClientConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            max_connections = config.max_connections,
            idle_timeout_ms = config.idle_timeout_ms,
            "Jira connection pool initialised"
        );

        Self {
            config,
            client_config,
            clock,
            entries: RwLock::new(HashMap::new()),
            creation_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            active_connections: AtomicUsize::new(0),
            total_created: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
        }
    }

    /// サーバーURLに対応する接続を取得（なければ作成）
    pub fn acquire(&self, server_url: &str) -> Result<Arc<PooledConnection>> {
        let key = connection_key(server_url)?;

        if let Some(connection) = self.reuse(&key) {
            return Ok(connection);
        }

        let _guard = self.creation_lock.lock().unwrap_or_else(|e| e.into_inner());

        // 待機中に他のスレッドが作成している可能性がある
        if let Some(connection) = self.reuse(&key) {
            return Ok(connection);
        }

        let now = self.clock.now();
        self.remove_where(|k, entry| k == key && entry.is_idle(now, self.config.idle_timeout_ms));

        if self.len() >= self.config.max_connections {
            let removed = self.cleanup_idle();
            if removed == 0 && self.len() >= self.config.max_connections {
                self.evict_least_recently_used();
            }
        }

        let client = self.build_client()?;
        let connection = Arc::new(PooledConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key: key.clone(),
            client,
            created_at: now,
            last_used_ms: AtomicI64::new(now.timestamp_millis()),
        });

        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), Arc::clone(&connection));
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        self.total_created.fetch_add(1, Ordering::Relaxed);

        info!(server = %key, active = self.len(), "Created new Jira connection");
        Ok(connection)
    }

    /// 指定サーバーの接続を破棄
    pub fn evict(&self, server_url: &str) -> Result<bool> {
        let key = connection_key(server_url)?;
        let removed = self.remove_where(|k, _| k == key);
        if removed > 0 {
            info!(server = %key, "Evicted Jira connection");
        }
        Ok(removed > 0)
    }

    /// 全接続を破棄
    pub fn evict_all(&self) -> usize {
        let removed = self.remove_where(|_, _| true);
        info!(removed, "Evicted all Jira connections");
        removed
    }

    /// アイドルタイムアウトを過ぎた接続を削除し、削除数を返す
    pub fn cleanup_idle(&self) -> usize {
        let now = self.clock.now();
        let idle_timeout_ms = self.config.idle_timeout_ms;
        let removed = self.remove_where(|_, entry| entry.is_idle(now, idle_timeout_ms));
        if removed > 0 {
            debug!(removed, active = self.len(), "Removed idle Jira connections");
        }
        removed
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        ConnectionPoolStats {
            max_connections: self.config.max_connections,
            active_connections: self.active_connections.load(Ordering::Acquire),
            cached_connections: self.len(),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_reused: self.total_reused.load(Ordering::Relaxed),
            total_evicted: self.total_evicted.load(Ordering::Relaxed),
            idle_timeout_ms: self.config.idle_timeout_ms,
        }
    }

    /// 定期的なアイドル掃除を開始
    pub fn start_cleanup(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = self.config.cleanup_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.cleanup_idle();
                    }
                }
            }
            debug!("Jira connection pool cleanup stopped");
        })
    }

    pub fn shutdown(&self) {
        let removed = self.remove_where(|_, _| true);
        info!(removed, "Jira connection pool shut down");
    }

    fn reuse(&self, key: &str) -> Option<Arc<PooledConnection>> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key)?;
        if entry.is_idle(now, self.config.idle_timeout_ms) {
            return None;
        }
        entry.touch(now);
        self.total_reused.fetch_add(1, Ordering::Relaxed);
        debug!(server = %key, "Reusing Jira connection");
        Some(Arc::clone(entry))
    }

    fn evict_least_recently_used(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used_ms())
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            entries.remove(&key);
            self.active_connections.fetch_sub(1, Ordering::AcqRel);
            self.total_evicted.fetch_add(1, Ordering::Relaxed);
            warn!(server = %key, "Connection pool at capacity, evicted least recently used connection");
        }
    }

    fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str, &PooledConnection) -> bool,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|key, entry| !predicate(key, entry));
        let removed = before - entries.len();

        if removed > 0 {
            self.active_connections.fetch_sub(removed, Ordering::AcqRel);
            self.total_evicted.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn build_client(&self) -> Result<Client> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        Client::builder()
            .default_headers(headers)
            .user_agent(self.client_config.user_agent.clone())
            .connect_timeout(Duration::from_millis(self.client_config.connect_timeout_ms))
            .timeout(Duration::from_millis(self.client_config.request_timeout_ms))
            .pool_idle_timeout(Duration::from_millis(self.config.idle_timeout_ms))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {}", e)))
    }
}
