pub mod config;
pub mod constraint;
pub mod driver;
pub mod error;
pub mod model;
pub mod parser;
pub mod service;
pub mod store;
pub mod table;
pub mod validation;

pub use config::ImportConfig;
pub use constraint::{
    find_conflict_row_numbers, is_unique_constraint_error, parse_unique_constraint_error,
    unique_conflict_error, ConstraintDetail, DbType,
};
pub use driver::{DriverError, DriverErrorInfo, DriverErrorParts, PersistError};
pub use error::{ErrorCode, ErrorResponse, ImportError, StorageError};
pub use model::{
    error_type, CommitRequest, CommitResponse, ImportErrorItem, ImportJob, ImportStatus,
    PreviewKind, PreviewResponse, PreviewRow, ValidateResponse, ValidationError,
};
pub use parser::{normalize_columns, ParseError, SpreadsheetParser, TabularParser};
pub use service::{ImportService, Persister, Upload, UploadOptions};
pub use store::{ArtifactPaths, ArtifactStore};
pub use table::{RowRef, Table, ROW_NUMBER};
pub use validation::{
    AcceptAll, DbCheck, DbCheckSpec, DbConflict, ErrorCollector, KeyTuple, RowContext,
    RowValidator, ValidationOutcome,
};

pub use staged_import_lock::{InMemoryLockClient, LockClient, LockError, LockReleaseMode};
#[cfg(feature = "redis")]
pub use staged_import_lock::RedisLockClient;
