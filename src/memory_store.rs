use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Error;
use crate::persistence::{
    CredentialSource, SecretDecryptor, StoredCredentials, SyncRecord, SyncRecordStore, SyncStatus,
};

/// メモリ上の同期記録ストア
///
/// 状態遷移の検証は書き込みロック内で行うため、同じ記録を2つのワーカーが同時に確保することはない。
#[derive(Debug, Clone, Default)]
pub struct InMemorySyncStore {
    records: Arc<RwLock<HashMap<String, SyncRecord>>>,
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: SyncRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn sorted(mut records: Vec<SyncRecord>) -> Vec<SyncRecord> {
        records.sort_by(|a, b| a.last_attempt_at.cmp(&b.last_attempt_at).then_with(|| a.id.cmp(&b.id)));
        records
    }
}

#[async_trait]
impl SyncRecordStore for InMemorySyncStore {
    async fn find_by_status_in(&self, statuses: &[SyncStatus], limit: usize) -> Result<Vec<SyncRecord>, Error> {
        let records = self.records.read().await;
        let matched = records
            .values()
            .filter(|r| statuses.contains(&r.sync_status))
            .cloned()
            .collect();
        Ok(Self::sorted(matched).into_iter().take(limit).collect())
    }

    async fn find_stuck_since(&self, threshold: DateTime<Utc>) -> Result<Vec<SyncRecord>, Error> {
        let records = self.records.read().await;
        let matched = records
            .values()
            .filter(|r| r.sync_status == SyncStatus::InProgress)
            .filter(|r| r.last_attempt_at.is_none_or(|at| at < threshold))
            .cloned()
            .collect();
        Ok(Self::sorted(matched))
    }

    async fn find_failed_before(&self, threshold: DateTime<Utc>, limit: usize) -> Result<Vec<SyncRecord>, Error> {
        let records = self.records.read().await;
        let matched = records
            .values()
            .filter(|r| r.sync_status == SyncStatus::Failed)
            .filter(|r| r.last_attempt_at.is_none_or(|at| at < threshold))
            .cloned()
            .collect();
        Ok(Self::sorted(matched).into_iter().take(limit).collect())
    }

    async fn update_status(&self, ids: &[String], status: SyncStatus, note: Option<&str>) -> Result<usize, Error> {
        let mut records = self.records.write().await;
        let mut updated = 0;

        for id in ids {
            if let Some(record) = records.get_mut(id) {
                if record.sync_status.can_transition_to(status) {
                    record.sync_status = status;
                    if let Some(note) = note {
                        record.last_error = Some(note.to_string());
                    }
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn try_claim(&self, id: &str, at: DateTime<Utc>) -> Result<Option<SyncRecord>, Error> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return Ok(None);
        };

        match record.mark_in_progress(at) {
            Ok(()) => Ok(Some(record.clone())),
            Err(Error::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save(&self, record: &SyncRecord) -> Result<(), Error> {
        self.records.write().await.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SyncRecord>, Error> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn count_by_status(&self) -> Result<HashMap<SyncStatus, usize>, Error> {
        let records = self.records.read().await;
        let mut counts = HashMap::new();
        for record in records.values() {
            *counts.entry(record.sync_status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// 実行者IDから接続情報を引くメモリ上のテーブル
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentialSource {
    entries: Arc<RwLock<HashMap<String, StoredCredentials>>>,
}

impl InMemoryCredentialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, actor_id: impl Into<String>, credentials: StoredCredentials) {
        self.entries.write().await.insert(actor_id.into(), credentials);
    }
}

#[async_trait]
impl CredentialSource for InMemoryCredentialSource {
    async fn credentials_for(&self, actor_id: &str) -> Result<Option<StoredCredentials>, Error> {
        Ok(self.entries.read().await.get(actor_id).cloned())
    }
}

/// 平文で保存されたトークンをそのまま返す
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextDecryptor;

impl SecretDecryptor for PlainTextDecryptor {
    fn decrypt(&self, secret: &str) -> Result<String, Error> {
        Ok(secret.to_string())
    }
}
