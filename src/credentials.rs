use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use url::Url;

use crate::error::{Error, Result};

/// Jira 接続情報（APIトークンは復号済み）
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub server_url: String,
    pub username: String,
    pub api_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("server_url", &self.server_url)
            .field("username", &self.username)
            .field("api_token", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(
        server_url: impl Into<String>,
        username: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Result<Self> {
        let server_url = normalize_server_url(&server_url.into())?;

        Url::parse(&server_url)
            .map_err(|_| Error::Validation("Invalid server URL".to_string()))?;

        Ok(Self {
            server_url,
            username: username.into(),
            api_token: api_token.into(),
        })
    }

    pub fn from_env() -> Result<Self> {
        use std::env;

        let server_url = env::var("JIRA_URL")
            .map_err(|_| Error::ConfigurationMissing("JIRA_URL not found in environment".to_string()))?;

        let username = env::var("JIRA_USER")
            .map_err(|_| Error::ConfigurationMissing("JIRA_USER not found in environment".to_string()))?;

        let api_token = env::var("JIRA_API_TOKEN")
            .map_err(|_| Error::ConfigurationMissing("JIRA_API_TOKEN not found in environment".to_string()))?;

        Self::new(server_url, username, api_token)
    }

    /// `Authorization` ヘッダー値
    pub fn basic_auth_header(&self) -> String {
        let auth_value = format!("{}:{}", self.username, self.api_token);
        let encoded = base64::engine::general_purpose::STANDARD.encode(auth_value.as_bytes());
        format!("Basic {}", encoded)
    }
}

/// サーバーURLの正規化（スキーム補完・末尾スラッシュ除去）
pub fn normalize_server_url(server_url: &str) -> Result<String> {
    let trimmed = server_url.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("サーバーURLが必要です".to_string()));
    }

    let mut normalized = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    while normalized.ends_with('/') {
        normalized.pop();
    }

    Ok(normalized)
}

/// 接続プールのキー（小文字化した正規化URL）
pub fn connection_key(server_url: &str) -> Result<String> {
    Ok(normalize_server_url(server_url)?.to_lowercase())
}

fn issue_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z]+-\d+$").expect("issue key pattern is valid"))
}

/// 課題キーの形式チェック（例: TEST-123）
pub fn is_valid_issue_key(issue_key: &str) -> bool {
    let trimmed = issue_key.trim();
    !trimmed.is_empty() && issue_key_pattern().is_match(trimmed)
}

/// 課題キーを検証し、前後の空白を除いたキーを返す
pub fn validate_issue_key(issue_key: &str) -> Result<&str> {
    if is_valid_issue_key(issue_key) {
        Ok(issue_key.trim())
    } else {
        Err(Error::Validation(format!("Invalid issue key: {}", issue_key)))
    }
}
