use serde::{Deserialize, Serialize};

/// `GET /rest/api/3/serverInfo` のレスポンス
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(rename = "baseUrl")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "deploymentType")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_type: Option<String>,
    #[serde(rename = "serverTitle")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_title: Option<String>,
}
