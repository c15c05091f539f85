use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ImportError;

/// インポートジョブの状態。
///
/// `uploaded → validated → committed` が正規の遷移。`commit_failed` は記録用で、
/// 再コミットを妨げない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Uploaded,
    Validated,
    Committed,
    CommitFailed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Uploaded => "uploaded",
            ImportStatus::Validated => "validated",
            ImportStatus::Committed => "committed",
            ImportStatus::CommitFailed => "commit_failed",
        }
    }

    /// コミットを受け付ける状態かどうか。
    pub fn is_committable(&self) -> bool {
        matches!(
            self,
            ImportStatus::Validated | ImportStatus::Committed | ImportStatus::CommitFailed
        )
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `meta.json` に保存されるジョブのメタデータ。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub import_id: Uuid,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub checksum: String,
    pub size_bytes: u64,
    /// Unix 秒。
    pub created_at: i64,
    pub status: ImportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_failed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_error: Option<String>,
}

/// よく使うエラー種別タグ。
pub mod error_type {
    pub const REQUIRED: &str = "required";
    pub const FORMAT: &str = "format";
    pub const INFILE_DUPLICATE: &str = "infile_duplicate";
    pub const DB_UNIQUE: &str = "db_unique";
    pub const DB_CHECK: &str = "db_check";
    pub const DB_CONFLICT: &str = "db_conflict";
    pub const VALIDATION: &str = "validation";
}

/// 1 件の検証エラー。`row_number == 0` は行に紐付かないバッチ全体のエラー。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub row_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ValidationError {
    pub fn new(row_number: u64, message: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            row_number,
            field: None,
            message: message.into(),
            kind: kind.into(),
            value: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// レスポンスに載せる検証エラーの要約。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportErrorItem {
    pub row_number: u64,
    pub field: Option<String>,
    pub message: String,
}

impl From<&ValidationError> for ImportErrorItem {
    fn from(e: &ValidationError) -> Self {
        Self {
            row_number: e.row_number,
            field: e.field.clone(),
            message: e.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub import_id: Uuid,
    pub checksum: String,
    pub total_rows: u64,
    pub valid_rows: u64,
    pub error_rows: u64,
    pub errors: Vec<ImportErrorItem>,
}

/// プレビュー対象。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewKind {
    All,
    Valid,
}

impl FromStr for PreviewKind {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(PreviewKind::All),
            "valid" => Ok(PreviewKind::Valid),
            other => Err(ImportError::InvalidArgument(format!(
                "kind must be all or valid, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewRow {
    pub row_number: u64,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub import_id: Uuid,
    pub checksum: String,
    pub page: usize,
    pub page_size: usize,
    pub total_rows: u64,
    pub rows: Vec<PreviewRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub import_id: Uuid,
    pub checksum: String,
    #[serde(default)]
    pub allow_overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResponse {
    pub import_id: Uuid,
    pub checksum: String,
    pub status: ImportStatus,
    pub imported_rows: u64,
    /// コミット完了時刻（Unix 秒）。
    pub committed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ImportStatus::CommitFailed).unwrap(),
            json!("commit_failed")
        );
        assert_eq!(ImportStatus::Validated.to_string(), "validated");
    }

    #[test]
    fn test_committable_states() {
        assert!(!ImportStatus::Uploaded.is_committable());
        assert!(ImportStatus::Validated.is_committable());
        assert!(ImportStatus::Committed.is_committable());
        assert!(ImportStatus::CommitFailed.is_committable());
    }

    #[test]
    fn test_validation_error_uses_type_key() {
        let err = ValidationError::new(3, "Required", error_type::REQUIRED).with_field("email");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], json!("required"));
        assert_eq!(value["field"], json!("email"));
        assert!(value.get("value").is_none());
    }

    #[test]
    fn test_meta_omits_unset_optional_fields() {
        let job = ImportJob {
            import_id: Uuid::now_v7(),
            filename: "a.csv".into(),
            content_type: Some("text/csv".into()),
            checksum: "abc".into(),
            size_bytes: 10,
            created_at: 1_700_000_000,
            status: ImportStatus::Uploaded,
            total_rows: None,
            valid_rows: None,
            error_rows: None,
            committed_at: None,
            imported_rows: None,
            commit_failed_at: None,
            commit_error: None,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], json!("uploaded"));
        assert!(value.get("committed_at").is_none());
    }

    #[test]
    fn test_preview_kind_from_str() {
        assert_eq!("all".parse::<PreviewKind>().unwrap(), PreviewKind::All);
        assert_eq!("valid".parse::<PreviewKind>().unwrap(), PreviewKind::Valid);
        assert!(matches!(
            "errors".parse::<PreviewKind>(),
            Err(ImportError::InvalidArgument(_))
        ));
    }
}
