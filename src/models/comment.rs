use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// コメント作成リクエスト（Atlassian Document Format）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentBody {
    pub body: Value,
}

impl CommentBody {
    /// 本文段落と生成時刻段落からなるADFドキュメント
    pub fn new(text: &str, generated_at: DateTime<Utc>) -> Self {
        let footer = format!(
            "生成時刻: {}",
            generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        Self {
            body: json!({
                "type": "doc",
                "version": 1,
                "content": [
                    paragraph(text),
                    paragraph(&footer),
                ]
            }),
        }
    }
}

fn paragraph(text: &str) -> Value {
    json!({
        "type": "paragraph",
        "content": [{ "type": "text", "text": text }]
    })
}

/// コメント作成レスポンス
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddedComment {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_comment_body_is_adf_document() {
        // Given: 本文と生成時刻
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();

        // When: コメント本文を作成
        let body = CommentBody::new("テスト実行結果", at);

        // Then: 2段落のADFドキュメント
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["body"]["type"], "doc");
        assert_eq!(json["body"]["version"], 1);
        let content = json["body"]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["content"][0]["text"], "テスト実行結果");
        assert_eq!(content[1]["content"][0]["text"], "生成時刻: 2024-03-01 09:30:00 UTC");
    }
}
