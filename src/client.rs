use chrono::{DateTime, Utc};
use reqwest::{Method, header};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::clock::{Clock, SystemClock};
use crate::connection_pool::ConnectionPool;
use crate::credentials::{Credentials, normalize_server_url, validate_issue_key};
use crate::error::{Error, FailureKind, Result};
use crate::models::{AddedComment, CommentBody, Issue, JqlSearchRequest, JqlSearchResponse, Project, ServerInfo};
use crate::monitor::HealthMonitor;

const EXISTENCE_FIELDS: &str = "key,summary,status,priority,issuetype";
/// 一括取得で1回の検索に含める課題キーの数
const BULK_LOOKUP_CHUNK: usize = 50;
/// 一括取得の検索と検索の間隔
const BULK_LOOKUP_PAUSE: Duration = Duration::from_millis(200);

/// 課題取得の結果（404 はエラーではない）
#[derive(Debug, Clone)]
pub enum IssueLookup {
    Found(Box<Issue>),
    NotFound,
}

impl IssueLookup {
    pub fn into_issue(self) -> Option<Issue> {
        match self {
            IssueLookup::Found(issue) => Some(*issue),
            IssueLookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, IssueLookup::Found(_))
    }
}

/// 接続テスト結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    /// `CONNECTED` または `FAILED`
    pub status: String,
    pub message: String,
    pub last_tested: DateTime<Utc>,
    pub jira_version: Option<String>,
    pub project_key: Option<String>,
    pub failure: Option<FailureKind>,
}

impl ConnectionStatus {
    fn connected(message: String, at: DateTime<Utc>, jira_version: Option<String>, project_key: Option<String>) -> Self {
        Self {
            connected: true,
            status: "CONNECTED".to_string(),
            message,
            last_tested: at,
            jira_version,
            project_key,
            failure: None,
        }
    }

    fn failed(message: String, at: DateTime<Utc>, failure: FailureKind) -> Self {
        Self {
            connected: false,
            status: "FAILED".to_string(),
            message,
            last_tested: at,
            jira_version: None,
            project_key: None,
            failure: Some(failure),
        }
    }
}

/// 課題の存在確認結果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueExistence {
    pub exists: bool,
    pub issue_key: String,
    pub summary: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub issue_type: Option<String>,
    pub error_message: Option<String>,
}

impl IssueExistence {
    fn missing(issue_key: &str, message: &str) -> Self {
        Self {
            exists: false,
            issue_key: issue_key.to_string(),
            error_message: Some(message.to_string()),
            ..Self::default()
        }
    }
}

/// テスト実行結果の判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestVerdict {
    Pass,
    Fail,
    Blocked,
    NotRun,
}

impl TestVerdict {
    fn label(&self) -> &'static str {
        match self {
            TestVerdict::Pass => "✅ 合格",
            TestVerdict::Fail => "❌ 不合格",
            TestVerdict::Blocked => "🚫 ブロック",
            TestVerdict::NotRun => "⏸️ 未実行",
        }
    }
}

/// コメントに整形するテスト実行結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResultSummary {
    pub test_case_name: String,
    pub verdict: TestVerdict,
    pub executed_by: String,
    pub executed_at: DateTime<Utc>,
    pub notes: Option<String>,
}

enum Outcome {
    Body(String),
    NotFound,
}

/// Jira REST API クライアント
///
/// 接続はプールから取得し、呼び出し結果は全てヘルスモニターに報告する。
#[derive(Clone)]
pub struct JiraClient {
    pool: Arc<ConnectionPool>,
    monitor: Arc<HealthMonitor>,
    audit: Option<Arc<AuditLogger>>,
    clock: Arc<dyn Clock>,
}

impl JiraClient {
    pub fn new(pool: Arc<ConnectionPool>, monitor: Arc<HealthMonitor>) -> Self {
        Self {
            pool,
            monitor,
            audit: None,
            clock: Arc::new(SystemClock),
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

    /// サーバー情報の取得と、任意でプロジェクトへのアクセスを確認
    pub async fn test_connection(&self, credentials: &Credentials, project_key: Option<&str>) -> ConnectionStatus {
        let now = self.clock.now();
        let status = self.check_connection(credentials, project_key, now).await;

        if let Some(audit) = &self.audit {
            let detail = (!status.connected).then_some(status.message.as_str());
            audit.log_connection_attempt(&credentials.username, &credentials.server_url, status.connected, detail);
        }
        status
    }

    async fn check_connection(&self, credentials: &Credentials, project_key: Option<&str>, now: DateTime<Utc>) -> ConnectionStatus {
        let server_info: ServerInfo = match self.get_json(credentials, "/rest/api/3/serverInfo").await {
            Ok(Some(info)) => info,
            Ok(None) => {
                return ConnectionStatus::failed(
                    "Jira サーバー情報が見つかりません。URLを確認してください。".to_string(),
                    now,
                    FailureKind::Unknown,
                );
            }
            Err(e) => return ConnectionStatus::failed(connection_failure_message(&e), now, e.kind()),
        };

        let project_key = project_key.map(str::trim).filter(|key| !key.is_empty());
        if let Some(key) = project_key {
            let endpoint = format!("/rest/api/3/project/{}", urlencoding::encode(key));
            match self.get_json::<Project>(credentials, &endpoint).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    return ConnectionStatus::failed(
                        format!("プロジェクト '{}' が見つかりません。", key),
                        now,
                        FailureKind::Validation,
                    );
                }
                Err(Error::Authorization { status: 403, .. }) => {
                    return ConnectionStatus::failed(
                        format!("プロジェクト '{}' へのアクセス権限がありません。", key),
                        now,
                        FailureKind::Authorization,
                    );
                }
                Err(e) => return ConnectionStatus::failed(connection_failure_message(&e), now, e.kind()),
            }
        }

        ConnectionStatus::connected(
            "Jira サーバーへの接続に成功しました。".to_string(),
            now,
            server_info.version,
            project_key.map(str::to_string),
        )
    }

    /// 課題を取得（404 は `IssueLookup::NotFound`）
    pub async fn get_issue(&self, credentials: &Credentials, issue_key: &str) -> Result<IssueLookup> {
        let issue_key = validate_issue_key(issue_key)?;
        let endpoint = format!("/rest/api/3/issue/{}", urlencoding::encode(issue_key));

        Ok(match self.get_json::<Issue>(credentials, &endpoint).await? {
            Some(issue) => IssueLookup::Found(Box::new(issue)),
            None => IssueLookup::NotFound,
        })
    }

    /// JQL で課題を検索
    pub async fn search_issues(&self, credentials: &Credentials, jql: &str, max_results: u32) -> Result<Vec<Issue>> {
        if jql.trim().is_empty() {
            return Err(Error::Validation("JQL must not be empty".to_string()));
        }
        if max_results == 0 {
            return Err(Error::Validation("max_results must be greater than zero".to_string()));
        }

        let request = JqlSearchRequest::new(jql.trim(), max_results);
        let body = serde_json::to_value(&request)?;

        match self
            .send(credentials, Method::POST, "searchIssues", "/rest/api/3/search/jql", Some(body))
            .await?
        {
            Outcome::Body(text) => {
                let response: JqlSearchResponse = serde_json::from_str(&text)?;
                debug!(count = response.issues.len(), "Jira search completed");
                Ok(response.issues)
            }
            Outcome::NotFound => Err(Error::Unexpected {
                status: Some(404),
                message: "Search endpoint not found".to_string(),
            }),
        }
    }

    /// 複数の課題を `key in (...)` の検索でまとめて取得
    ///
    /// キーは重複を除いて50件ずつ検索し、検索の間に200ミリ秒待つ。
    /// 形式の正しくないキーは検索に含めない。見つからなかった課題は結果に入らない。
    pub async fn get_issues_by_keys<S: AsRef<str>>(
        &self,
        credentials: &Credentials,
        issue_keys: &[S],
    ) -> Result<HashMap<String, Issue>> {
        let mut keys = BTreeSet::new();
        for raw in issue_keys {
            match validate_issue_key(raw.as_ref()) {
                Ok(key) => {
                    keys.insert(key.to_string());
                }
                Err(_) => debug!(issue_key = raw.as_ref(), "Skipping invalid issue key in bulk lookup"),
            }
        }
        let keys: Vec<String> = keys.into_iter().collect();

        let mut found = HashMap::with_capacity(keys.len());
        for (i, chunk) in keys.chunks(BULK_LOOKUP_CHUNK).enumerate() {
            if i > 0 {
                tokio::time::sleep(BULK_LOOKUP_PAUSE).await;
            }
            let quoted: Vec<String> = chunk.iter().map(|key| format!("\"{}\"", key)).collect();
            let jql = format!("key in ({})", quoted.join(","));

            for issue in self.search_issues(credentials, &jql, BULK_LOOKUP_CHUNK as u32).await? {
                found.insert(issue.key.clone(), issue);
            }
        }

        info!(requested = keys.len(), found = found.len(), "Jira bulk issue lookup completed");
        Ok(found)
    }

    /// 課題にコメントを追加
    pub async fn add_comment(&self, credentials: &Credentials, issue_key: &str, text: &str) -> Result<AddedComment> {
        let issue_key = validate_issue_key(issue_key)?;
        if text.trim().is_empty() {
            return Err(Error::Validation("Comment text must not be empty".to_string()));
        }

        let endpoint = format!("/rest/api/3/issue/{}/comment", urlencoding::encode(issue_key));
        let body = serde_json::to_value(CommentBody::new(text, self.clock.now()))?;

        let result = match self
            .send(credentials, Method::POST, "addComment", &endpoint, Some(body))
            .await
        {
            Ok(Outcome::Body(text)) => serde_json::from_str::<AddedComment>(&text).map_err(Error::from),
            Ok(Outcome::NotFound) => Err(Error::Unexpected {
                status: Some(404),
                message: format!("Issue not found: {}", issue_key),
            }),
            Err(e) => Err(e),
        };

        if let Some(audit) = &self.audit {
            let error_message = result.as_ref().err().map(|e| e.to_string());
            audit.log_issue_comment(&credentials.username, issue_key, result.is_ok(), error_message.as_deref());
        }
        result
    }

    /// 課題の存在確認（失敗理由はメッセージとして返す）
    pub async fn check_issue_exists(&self, credentials: &Credentials, issue_key: &str) -> IssueExistence {
        let Ok(key) = validate_issue_key(issue_key) else {
            return IssueExistence::missing(issue_key.trim(), "課題キーの形式が正しくありません。（例: TEST-123）");
        };

        let endpoint = format!("/rest/api/3/issue/{}?fields={}", urlencoding::encode(key), EXISTENCE_FIELDS);
        match self.get_json::<Issue>(credentials, &endpoint).await {
            Ok(Some(issue)) => IssueExistence {
                exists: true,
                issue_key: key.to_string(),
                summary: Some(issue.fields.summary.clone()),
                status: issue.status_name().map(str::to_string),
                priority: issue.priority_name().map(str::to_string),
                issue_type: issue.issue_type_name().map(str::to_string),
                error_message: None,
            },
            Ok(None) => IssueExistence::missing(key, "課題が見つかりません。"),
            Err(Error::Authorization { status: 403, .. }) => {
                IssueExistence::missing(key, "課題へのアクセス権限がありません。")
            }
            Err(Error::Authorization { .. }) => {
                IssueExistence::missing(key, "Jira 認証に失敗しました。APIトークンを確認してください。")
            }
            Err(Error::Server { .. }) => IssueExistence::missing(key, "Jira サーバーでエラーが発生しました。"),
            Err(Error::Connectivity(_)) => {
                IssueExistence::missing(key, "Jira サーバーに接続できません。ネットワークを確認してください。")
            }
            Err(e) => IssueExistence::missing(key, &format!("課題の確認中にエラーが発生しました: {}", e)),
        }
    }

    pub async fn get_projects(&self, credentials: &Credentials) -> Result<Vec<Project>> {
        let result = self
            .get_json::<Vec<Project>>(credentials, "/rest/api/3/project")
            .await
            .map(Option::unwrap_or_default);

        if let Some(audit) = &self.audit {
            let count = result.as_ref().map(Vec::len).unwrap_or(0);
            audit.log_project_access(&credentials.username, &credentials.server_url, count, result.is_ok());
        }
        result
    }

    pub async fn get_project(&self, credentials: &Credentials, project_key: &str) -> Result<Option<Project>> {
        let project_key = project_key.trim();
        if project_key.is_empty() {
            return Err(Error::Validation("Project key must not be empty".to_string()));
        }
        let endpoint = format!("/rest/api/3/project/{}", urlencoding::encode(project_key));
        self.get_json(credentials, &endpoint).await
    }

    /// 課題のブラウザURL
    pub fn issue_url(server_url: &str, issue_key: &str) -> Result<String> {
        let server_url = normalize_server_url(server_url)?;
        let issue_key = validate_issue_key(issue_key)?;
        Ok(format!("{}/browse/{}", server_url, issue_key))
    }

    /// テスト実行結果をコメント本文に整形
    pub fn format_test_result_comment(summary: &TestResultSummary) -> String {
        let mut comment = String::new();

        comment.push_str("🧪 *テスト実行結果*\n\n");
        comment.push_str(&format!("*テストケース:* {}\n", summary.test_case_name));
        comment.push_str(&format!("*実行結果:* {}\n", summary.verdict.label()));
        comment.push_str(&format!("*実行者:* {}\n", summary.executed_by));
        comment.push_str(&format!(
            "*実行日時:* {}\n",
            summary.executed_at.format("%Y-%m-%d %H:%M:%S")
        ));

        if let Some(notes) = summary.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            comment.push_str("\n*詳細:*\n");
            comment.push_str(notes);
            comment.push('\n');
        }

        comment.push_str("\n---\n");
        comment.push_str("_自動生成されたテスト結果レポート_");
        comment
    }

    async fn get_json<T: DeserializeOwned>(&self, credentials: &Credentials, endpoint: &str) -> Result<Option<T>> {
        match self.send(credentials, Method::GET, "get", endpoint, None).await? {
            Outcome::Body(text) => Ok(Some(serde_json::from_str(&text)?)),
            Outcome::NotFound => Ok(None),
        }
    }

    async fn send(
        &self,
        credentials: &Credentials,
        method: Method,
        operation: &str,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Outcome> {
        let connection = self.pool.acquire(&credentials.server_url)?;
        let url = format!("{}{}", credentials.server_url, endpoint);

        let mut request = connection
            .client()
            .request(method, &url)
            .header(header::AUTHORIZATION, credentials.basic_auth_header());
        if let Some(body) = &body {
            request = request.json(body);
        }

        let started = Instant::now();
        let result = match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.map_err(Error::from);
                match (status, text) {
                    (200..=299, Ok(text)) => Ok(Outcome::Body(text)),
                    (404, _) => Ok(Outcome::NotFound),
                    (_, Err(e)) => Err(e),
                    (status, Ok(text)) => Err(Error::from_status(status, text)),
                }
            }
            Err(e) => Err(Error::from(e)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => self.monitor.record_call(true, latency_ms),
            Err(e) => {
                if matches!(
                    e.kind(),
                    FailureKind::Authorization | FailureKind::Server | FailureKind::Connectivity
                ) {
                    self.monitor.record_error(format!("{} {}: {}", operation, endpoint, e));
                }
                // 成功率が90%以上なら、この集計で健全に戻り last_error も消える
                self.monitor.record_call(false, latency_ms);
                warn!(operation, endpoint, latency_ms, error = %e, "Jira API call failed");
            }
        }

        if let Some(audit) = &self.audit {
            let error_message = result.as_ref().err().map(|e| e.to_string());
            audit.log_api_call(
                &credentials.username,
                operation,
                endpoint,
                result.is_ok(),
                latency_ms,
                error_message.as_deref(),
            );
        }

        result
    }
}

fn connection_failure_message(error: &Error) -> String {
    match error {
        Error::Authorization { status: 401, .. } => {
            "認証に失敗しました。ユーザー名とAPIトークンを確認してください。".to_string()
        }
        Error::Authorization { .. } => "アクセス権限がありません。アカウントの権限を確認してください。".to_string(),
        Error::Server { status, .. } => format!("Jira サーバーエラーが発生しました。(HTTP {})", status),
        Error::Connectivity(_) => "Jira サーバーに接続できません。URLとネットワークを確認してください。".to_string(),
        Error::Validation(message) | Error::Configuration(message) => message.clone(),
        other => format!("接続テスト中にエラーが発生しました: {}", other),
    }
}
