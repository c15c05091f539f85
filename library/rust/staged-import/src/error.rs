//! インポート処理のエラー体系。
//!
//! エラーコードは `SYS_{SERVICE}_{ERROR}` 形式（SERVICE = `IMPORT`）。
//! ホスト側のフレームワークは `to_error_response()` の結果をそのままシリアライズできる。

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use staged_import_lock::LockError;
use thiserror::Error;
use uuid::Uuid;

use crate::driver::PersistError;
use crate::model::{ImportStatus, ValidationError};

const SERVICE: &str = "IMPORT";

/// 機械可読なエラーコード。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode(String);

impl ErrorCode {
    fn of(error: &str) -> Self {
        Self(format!("SYS_{SERVICE}_{error}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// `{ "error": ... }` 形式のエンベロープ。
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// アーティファクトストアのエラー。OS のエラーはパス付きで包んで返す。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt metadata at {}: {source}", .path.display())]
    CorruptMetadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// `parsed.json` / `valid.json` / `errors.json` が壊れている。
    #[error("corrupt artifact at {}: {source}", .path.display())]
    CorruptArtifact {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("file too large: limit is {limit_mb} MB")]
    PayloadTooLarge { limit_mb: u64 },

    #[error("import_id not found or expired: {0}")]
    NotFoundOrExpired(Uuid),

    #[error("checksum cannot be empty")]
    EmptyChecksum,

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid import status: {0}; complete validation first")]
    InvalidStatus(ImportStatus),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("validation errors exist; batch import is blocked")]
    ValidationErrorsBlock { errors: Vec<ValidationError> },

    #[error("validated data is missing; re-validate or re-upload")]
    MissingValidatedData,

    #[error("import in progress, retry later")]
    ImportInProgress,

    #[error("{message}")]
    UniqueConflict { message: String, details: Value },

    #[error("failed to parse upload: {0}")]
    Parse(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("lock service error: {0}")]
    Lock(#[from] LockError),

    #[error("row validation failed: {0}")]
    Validator(#[source] anyhow::Error),

    /// 一意制約違反と判定されなかった永続化エラー。元のエラーをそのまま保持する。
    #[error(transparent)]
    Persist(PersistError),
}

impl ImportError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ImportError::UnsupportedMediaType(_) => ErrorCode::of("UNSUPPORTED_MEDIA_TYPE"),
            ImportError::PayloadTooLarge { .. } => ErrorCode::of("PAYLOAD_TOO_LARGE"),
            ImportError::NotFoundOrExpired(_) => ErrorCode::of("NOT_FOUND"),
            ImportError::EmptyChecksum => ErrorCode::of("EMPTY_CHECKSUM"),
            ImportError::ChecksumMismatch => ErrorCode::of("CHECKSUM_MISMATCH"),
            ImportError::InvalidStatus(_) => ErrorCode::of("INVALID_STATUS"),
            ImportError::InvalidArgument(_) => ErrorCode::of("INVALID_ARGUMENT"),
            ImportError::ValidationErrorsBlock { .. } => ErrorCode::of("VALIDATION_ERRORS_BLOCK"),
            ImportError::MissingValidatedData => ErrorCode::of("MISSING_VALIDATED_DATA"),
            ImportError::ImportInProgress => ErrorCode::of("IN_PROGRESS"),
            ImportError::UniqueConflict { .. } => ErrorCode::of("UNIQUE_CONFLICT"),
            ImportError::Parse(_) => ErrorCode::of("PARSE_FAILED"),
            ImportError::Storage(StorageError::CorruptMetadata { .. }) => {
                ErrorCode::of("CORRUPT_METADATA")
            }
            ImportError::Storage(StorageError::CorruptArtifact { .. }) => {
                ErrorCode::of("CORRUPT_ARTIFACT")
            }
            ImportError::Storage(_) => ErrorCode::of("STORAGE_ERROR"),
            ImportError::Lock(_) => ErrorCode::of("LOCK_UNAVAILABLE"),
            ImportError::Validator(_) => ErrorCode::of("INTERNAL_ERROR"),
            ImportError::Persist(_) => ErrorCode::of("PERSIST_FAILED"),
        }
    }

    /// HTTP ステータスコードのヒント。
    pub fn status_code(&self) -> u16 {
        match self {
            ImportError::UnsupportedMediaType(_) => 415,
            ImportError::PayloadTooLarge { .. } => 413,
            ImportError::NotFoundOrExpired(_) => 404,
            ImportError::EmptyChecksum
            | ImportError::ChecksumMismatch
            | ImportError::InvalidStatus(_)
            | ImportError::InvalidArgument(_)
            | ImportError::ValidationErrorsBlock { .. }
            | ImportError::Parse(_) => 400,
            ImportError::MissingValidatedData
            | ImportError::ImportInProgress
            | ImportError::UniqueConflict { .. } => 409,
            ImportError::Storage(_) | ImportError::Validator(_) | ImportError::Persist(_) => 500,
            ImportError::Lock(_) => 503,
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            ImportError::ValidationErrorsBlock { errors } => serde_json::to_value(errors).ok(),
            ImportError::UniqueConflict { details, .. } => Some(details.clone()),
            _ => None,
        }
    }

    /// 再試行で解消しうるエラーかどうか。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImportError::ImportInProgress | ImportError::Lock(_)
        )
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                request_id: Uuid::new_v4().to_string(),
                details: self.details(),
            },
        }
    }
}

impl From<PersistError> for ImportError {
    fn from(err: PersistError) -> Self {
        ImportError::Persist(err)
    }
}
