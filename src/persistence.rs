use crate::error::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 同期状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    NotSynced,
    InProgress,
    Success,
    Failed,
    RetryRequired,
}

impl SyncStatus {
    /// メインパスが拾う状態
    pub const PENDING: [SyncStatus; 3] = [
        SyncStatus::NotSynced,
        SyncStatus::Failed,
        SyncStatus::RetryRequired,
    ];

    pub const ALL: [SyncStatus; 5] = [
        SyncStatus::NotSynced,
        SyncStatus::InProgress,
        SyncStatus::Success,
        SyncStatus::Failed,
        SyncStatus::RetryRequired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::NotSynced => "NOT_SYNCED",
            SyncStatus::InProgress => "IN_PROGRESS",
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Failed => "FAILED",
            SyncStatus::RetryRequired => "RETRY_REQUIRED",
        }
    }

    /// 許可された状態遷移か
    ///
    /// SUCCESS から IN_PROGRESS へは直接戻れない（RETRY_REQUIRED を経由する）。
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (NotSynced | Failed | RetryRequired, InProgress)
                | (InProgress, Success | Failed | RetryRequired)
                | (Failed | Success, RetryRequired)
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 外部ストアが保持する同期記録
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: String,
    pub remote_issue_key: String,
    pub sync_status: SyncStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// 実行者（認証情報の解決に使う）
    pub actor_id: String,
    /// 投稿するコメント本文
    pub comment: String,
    pub remote_comment_id: Option<String>,
}

impl SyncRecord {
    pub fn new(
        id: impl Into<String>,
        remote_issue_key: impl Into<String>,
        actor_id: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            remote_issue_key: remote_issue_key.into(),
            sync_status: SyncStatus::NotSynced,
            last_attempt_at: None,
            last_error: None,
            actor_id: actor_id.into(),
            comment: comment.into(),
            remote_comment_id: None,
        }
    }

    pub fn mark_in_progress(&mut self, at: DateTime<Utc>) -> Result<(), Error> {
        self.transition(SyncStatus::InProgress)?;
        self.last_attempt_at = Some(at);
        self.last_error = None;
        Ok(())
    }

    pub fn mark_success(&mut self, comment_id: Option<String>, at: DateTime<Utc>) -> Result<(), Error> {
        self.transition(SyncStatus::Success)?;
        self.remote_comment_id = comment_id;
        self.last_attempt_at = Some(at);
        self.last_error = None;
        Ok(())
    }

    pub fn mark_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> Result<(), Error> {
        self.transition(SyncStatus::Failed)?;
        self.last_attempt_at = Some(at);
        self.last_error = Some(error.into());
        Ok(())
    }

    pub fn mark_retry_required(&mut self, note: Option<String>) -> Result<(), Error> {
        self.transition(SyncStatus::RetryRequired)?;
        if note.is_some() {
            self.last_error = note;
        }
        Ok(())
    }

    fn transition(&mut self, next: SyncStatus) -> Result<(), Error> {
        if !self.sync_status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.sync_status.to_string(),
                to: next.to_string(),
            });
        }
        self.sync_status = next;
        Ok(())
    }
}

/// 同期記録ストアの抽象化トレイト
#[async_trait]
pub trait SyncRecordStore: Send + Sync {
    /// 指定状態の記録を最大 `limit` 件取得
    async fn find_by_status_in(&self, statuses: &[SyncStatus], limit: usize) -> Result<Vec<SyncRecord>, Error>;

    /// `threshold` より前から IN_PROGRESS のままの記録
    async fn find_stuck_since(&self, threshold: DateTime<Utc>) -> Result<Vec<SyncRecord>, Error>;

    /// `threshold` より前に FAILED になった記録
    async fn find_failed_before(&self, threshold: DateTime<Utc>, limit: usize) -> Result<Vec<SyncRecord>, Error>;

    /// 一括で状態を変更し、実際に変更した件数を返す（許可されない遷移は無視）
    async fn update_status(&self, ids: &[String], status: SyncStatus, note: Option<&str>) -> Result<usize, Error>;

    /// 処理対象として確保（IN_PROGRESS へ遷移できた場合のみ記録を返す）
    async fn try_claim(&self, id: &str, at: DateTime<Utc>) -> Result<Option<SyncRecord>, Error>;

    async fn save(&self, record: &SyncRecord) -> Result<(), Error>;

    async fn find_by_id(&self, id: &str) -> Result<Option<SyncRecord>, Error>;

    async fn count_by_status(&self) -> Result<HashMap<SyncStatus, usize>, Error>;
}

/// 保存済みの接続情報（APIトークンは暗号化済み）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub server_url: String,
    pub username: String,
    pub encrypted_api_token: String,
}

/// 実行者ごとの接続情報の取得元
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials_for(&self, actor_id: &str) -> Result<Option<StoredCredentials>, Error>;
}

/// 保存済みシークレットの復号
pub trait SecretDecryptor: Send + Sync {
    fn decrypt(&self, secret: &str) -> Result<String, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use SyncStatus::*;

        assert!(NotSynced.can_transition_to(InProgress));
        assert!(Failed.can_transition_to(InProgress));
        assert!(RetryRequired.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Success));
        assert!(InProgress.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(RetryRequired));
        assert!(Failed.can_transition_to(RetryRequired));
        assert!(Success.can_transition_to(RetryRequired));
    }

    #[test]
    fn test_forbidden_transitions() {
        use SyncStatus::*;

        assert!(!InProgress.can_transition_to(InProgress));
        assert!(!Success.can_transition_to(InProgress));
        assert!(!NotSynced.can_transition_to(Success));
        assert!(!RetryRequired.can_transition_to(RetryRequired));
    }

    #[test]
    fn test_record_lifecycle() {
        // Given: 未同期の記録
        let now = Utc::now();
        let mut record = SyncRecord::new("r1", "TEST-1", "alice", "PASS");

        // When: 処理開始 → 失敗 → 再試行待ち → 処理開始 → 成功
        record.mark_in_progress(now).unwrap();
        record.mark_failure("HTTP 503", now).unwrap();
        assert_eq!(record.last_error.as_deref(), Some("HTTP 503"));
        record.mark_retry_required(None).unwrap();
        record.mark_in_progress(now).unwrap();
        record.mark_success(Some("c-1".to_string()), now).unwrap();

        // Then: 成功状態でエラーはクリアされる
        assert_eq!(record.sync_status, SyncStatus::Success);
        assert_eq!(record.remote_comment_id.as_deref(), Some("c-1"));
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_double_in_progress_rejected() {
        let mut record = SyncRecord::new("r1", "TEST-1", "alice", "PASS");
        record.mark_in_progress(Utc::now()).unwrap();

        let result = record.mark_in_progress(Utc::now());

        match result {
            Err(Error::InvalidTransition { from, to }) => {
                assert_eq!(from, "IN_PROGRESS");
                assert_eq!(to, "IN_PROGRESS");
            }
            other => panic!("Expected InvalidTransition, got {:?}", other),
        }
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SyncStatus::RetryRequired).unwrap();
        assert_eq!(json, "\"RETRY_REQUIRED\"");
    }
}
