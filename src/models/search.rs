use super::Issue;
use serde::{Deserialize, Serialize};

/// 検索時に取得するフィールド
pub const SEARCH_FIELDS: [&str; 7] = [
    "key", "summary", "status", "priority", "created", "updated", "assignee",
];

/// `POST /rest/api/3/search/jql` のリクエストボディ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JqlSearchRequest {
    pub jql: String,
    #[serde(rename = "maxResults")]
    pub max_results: u32,
    pub fields: Vec<String>,
    #[serde(rename = "nextPageToken")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

impl JqlSearchRequest {
    pub fn new(jql: impl Into<String>, max_results: u32) -> Self {
        Self {
            jql: jql.into(),
            max_results,
            fields: SEARCH_FIELDS.iter().map(|f| f.to_string()).collect(),
            next_page_token: None,
        }
    }

    pub fn next_page_token(mut self, token: impl Into<String>) -> Self {
        self.next_page_token = Some(token.into());
        self
    }
}

/// `POST /rest/api/3/search/jql` のレスポンス
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JqlSearchResponse {
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(rename = "nextPageToken")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    #[serde(rename = "isLast")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_last: Option<bool>,
}
