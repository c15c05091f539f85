//! 永続化層から返るエラーの検査。
//!
//! ドライバごとのエラーは `DriverError` のいずれかのバリアントに変換してから渡す。
//! コミット処理は `DriverErrorInfo` 経由で本文・detail・制約名だけを参照する。

use serde_json::{Map, Value};
use thiserror::Error;

/// ドライバエラーから一意制約の解析に必要な情報を取り出すためのインターフェース。
pub trait DriverErrorInfo {
    fn message(&self) -> &str;

    /// PostgreSQL の `DETAIL` 行などの補足テキスト。
    fn detail(&self) -> Option<&str> {
        None
    }

    fn constraint(&self) -> Option<&str> {
        None
    }

    /// `{constraint, detail}` のうち得られたものだけを持つマップ。どちらも無ければ `None`。
    fn extra_details(&self) -> Option<Map<String, Value>> {
        let mut extra = Map::new();
        if let Some(c) = self.constraint() {
            extra.insert("constraint".into(), Value::String(c.to_string()));
        }
        if let Some(d) = self.detail() {
            extra.insert("detail".into(), Value::String(d.to_string()));
        }
        (!extra.is_empty()).then_some(extra)
    }
}

/// ドライバエラーの共通部分。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverErrorParts {
    pub message: String,
    pub detail: Option<String>,
    pub constraint: Option<String>,
}

impl DriverErrorParts {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }
}

/// 方言ごとにタグ付けしたドライバエラー。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("{}", .0.message)]
    Postgres(DriverErrorParts),
    #[error("{}", .0.message)]
    MySql(DriverErrorParts),
    #[error("{}", .0.message)]
    Sqlite(DriverErrorParts),
    #[error("{}", .0.message)]
    MsSql(DriverErrorParts),
    #[error("{}", .0.message)]
    Oracle(DriverErrorParts),
    #[error("{}", .0.message)]
    Generic(DriverErrorParts),
}

impl DriverError {
    pub fn parts(&self) -> &DriverErrorParts {
        match self {
            DriverError::Postgres(p)
            | DriverError::MySql(p)
            | DriverError::Sqlite(p)
            | DriverError::MsSql(p)
            | DriverError::Oracle(p)
            | DriverError::Generic(p) => p,
        }
    }
}

impl DriverErrorInfo for DriverError {
    fn message(&self) -> &str {
        &self.parts().message
    }

    fn detail(&self) -> Option<&str> {
        self.parts().detail.as_deref()
    }

    fn constraint(&self) -> Option<&str> {
        self.parts().constraint.as_deref()
    }
}

/// `Persister` が返すエラー。
#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Driver(DriverError),

    #[error(transparent)]
    Other(anyhow::Error),
}

impl PersistError {
    pub fn driver_info(&self) -> Option<&dyn DriverErrorInfo> {
        match self {
            PersistError::Driver(d) => Some(d),
            PersistError::Other(_) => None,
        }
    }
}

impl From<DriverError> for PersistError {
    fn from(err: DriverError) -> Self {
        PersistError::Driver(err)
    }
}

/// `anyhow::Error` に包まれた `DriverError` は取り出して `Driver` として扱う。
impl From<anyhow::Error> for PersistError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<DriverError>() {
            Ok(driver) => PersistError::Driver(driver),
            Err(other) => PersistError::Other(other),
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for PersistError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => PersistError::Driver(DriverError::from(&*db)),
            other => PersistError::Other(anyhow::Error::new(other)),
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<&dyn sqlx::error::DatabaseError> for DriverError {
    fn from(db: &dyn sqlx::error::DatabaseError) -> Self {
        let mut parts = DriverErrorParts::new(db.message());
        parts.constraint = db.constraint().map(ToString::to_string);

        if let Some(pg) = db.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
            parts.detail = pg.detail().map(ToString::to_string);
            return DriverError::Postgres(parts);
        }
        DriverError::Generic(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_details() {
        let err = DriverError::Postgres(
            DriverErrorParts::new("duplicate key value violates unique constraint \"uq\"")
                .with_detail("Key (email)=(a@b.com) already exists.")
                .with_constraint("uq"),
        );
        let extra = err.extra_details().unwrap();
        assert_eq!(extra["constraint"], "uq");
        assert_eq!(extra["detail"], "Key (email)=(a@b.com) already exists.");
    }

    #[test]
    fn test_extra_details_absent() {
        let err = DriverError::Sqlite(DriverErrorParts::new("UNIQUE constraint failed: t.c"));
        assert!(err.extra_details().is_none());
        assert_eq!(err.to_string(), "UNIQUE constraint failed: t.c");
    }

    #[test]
    fn test_anyhow_wrapped_driver_error_is_recovered() {
        let wrapped = anyhow::Error::new(DriverError::MySql(DriverErrorParts::new(
            "Duplicate entry 'x' for key 'k'",
        )));
        let err = PersistError::from(wrapped);
        assert!(matches!(err, PersistError::Driver(DriverError::MySql(_))));
        assert_eq!(
            err.driver_info().unwrap().message(),
            "Duplicate entry 'x' for key 'k'"
        );
    }

    #[test]
    fn test_plain_anyhow_stays_other() {
        let err = PersistError::from(anyhow::anyhow!("disk full"));
        assert!(err.driver_info().is_none());
        assert_eq!(err.to_string(), "disk full");
    }
}
