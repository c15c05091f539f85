//! 各 DB 方言の一意制約違反メッセージの解析。
//!
//! PostgreSQL → MySQL/MariaDB → SQLite → SQL Server → Oracle の順に試し、
//! 最初に一致したものを採用する。照合は大文字小文字を区別しない。

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::ImportError;
use crate::table::{Table, ROW_NUMBER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Postgresql,
    Mysql,
    Sqlite,
    Mssql,
    Oracle,
    Unknown,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Postgresql => "postgresql",
            DbType::Mysql => "mysql",
            DbType::Sqlite => "sqlite",
            DbType::Mssql => "mssql",
            DbType::Oracle => "oracle",
            DbType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一意制約違反から取り出した構造化情報。
///
/// `columns` と `values` が両方空でなければ位置で対応する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintDetail {
    pub db_type: DbType,
    pub columns: Vec<String>,
    pub values: Vec<String>,
    pub constraint_name: Option<String>,
}

impl ConstraintDetail {
    fn has_signal(&self) -> bool {
        !self.columns.is_empty() || !self.values.is_empty() || self.constraint_name.is_some()
    }
}

// 正規表現はすべてリテラルのため構築に失敗しない
static PG_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Key\s+\((?P<cols>[^)]+)\)=\((?P<vals>[^)]+)\)\s+already exists")
        .expect("valid regex")
});
static PG_CONSTRAINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)unique constraint "(?P<name>[^"]+)""#).expect("valid regex")
});
static MYSQL_DUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Duplicate entry '(?P<val>[^']+)' for key '(?P<key>[^']+)'")
        .expect("valid regex")
});
static SQLITE_UNIQUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)UNIQUE constraint failed:\s*(?P<cols>[^\r\n]+)").expect("valid regex")
});
static MSSQL_CONSTRAINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Violation of UNIQUE KEY constraint '(?P<name>[^']+)'").expect("valid regex")
});
static MSSQL_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)The duplicate key value is \((?P<vals>[^)]+)\)").expect("valid regex")
});
static ORACLE_UNIQUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ORA-00001:\s*unique constraint \((?P<name>[^)]+)\) violated")
        .expect("valid regex")
});

type DialectParser = fn(&str, &str) -> Option<ConstraintDetail>;

const PARSERS: [DialectParser; 5] = [parse_pg, parse_mysql, parse_sqlite, parse_mssql, parse_oracle];

const UNIQUE_KEYWORDS: [&str; 6] = [
    "duplicate key value violates unique constraint",
    "duplicate entry",
    "unique constraint failed",
    "violation of unique key constraint",
    "ora-00001",
    "already exists",
];

fn split_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// `Key (col1, col2)=(v1, v2) already exists.` を detail → 本文の順に探す。
/// 制約名は本文の `unique constraint "name"` から取る。
fn parse_pg(text: &str, detail: &str) -> Option<ConstraintDetail> {
    let caps = [detail, text]
        .into_iter()
        .filter(|s| !s.is_empty())
        .find_map(|s| PG_KEY.captures(s))?;
    let constraint_name = PG_CONSTRAINT
        .captures(text)
        .map(|c| c["name"].to_string());
    Some(ConstraintDetail {
        db_type: DbType::Postgresql,
        columns: split_list(&caps["cols"], ','),
        values: split_list(&caps["vals"], ','),
        constraint_name,
    })
}

/// 複合キーの値はハイフンで連結されて報告されるため分割し直す。
fn parse_mysql(text: &str, detail: &str) -> Option<ConstraintDetail> {
    let combined = format!("{text} {detail}");
    let caps = MYSQL_DUP.captures(&combined)?;
    let val = &caps["val"];
    let values = if val.contains('-') {
        split_list(val, '-')
    } else {
        vec![val.to_string()]
    };
    Some(ConstraintDetail {
        db_type: DbType::Mysql,
        columns: Vec::new(),
        values,
        constraint_name: Some(caps["key"].to_string()),
    })
}

fn parse_sqlite(text: &str, detail: &str) -> Option<ConstraintDetail> {
    let combined = format!("{text} {detail}");
    let caps = SQLITE_UNIQUE.captures(&combined)?;
    let columns = caps["cols"]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|part| part.rsplit('.').next().unwrap_or(part).trim().to_string())
        .collect();
    Some(ConstraintDetail {
        db_type: DbType::Sqlite,
        columns,
        values: Vec::new(),
        constraint_name: None,
    })
}

fn parse_mssql(text: &str, detail: &str) -> Option<ConstraintDetail> {
    let combined = format!("{text} {detail}");
    let constraint_name = MSSQL_CONSTRAINT
        .captures(&combined)
        .map(|c| c["name"].to_string());
    let values = MSSQL_VALUE
        .captures(&combined)
        .map(|c| split_list(&c["vals"], ','))
        .unwrap_or_default();
    if constraint_name.is_none() && values.is_empty() {
        return None;
    }
    Some(ConstraintDetail {
        db_type: DbType::Mssql,
        columns: Vec::new(),
        values,
        constraint_name,
    })
}

fn parse_oracle(text: &str, detail: &str) -> Option<ConstraintDetail> {
    let combined = format!("{text} {detail}");
    let caps = ORACLE_UNIQUE.captures(&combined)?;
    Some(ConstraintDetail {
        db_type: DbType::Oracle,
        columns: Vec::new(),
        values: Vec::new(),
        constraint_name: Some(caps["name"].to_string()),
    })
}

/// 一意制約違反メッセージを解析する。どの方言にも一致しなければ `None`。
pub fn parse_unique_constraint_error(text: &str, detail: &str) -> Option<ConstraintDetail> {
    PARSERS.iter().find_map(|parse| parse(text, detail))
}

/// 一意制約違反らしいかをキーワードで判定する。構造化抽出の成否とは独立。
pub fn is_unique_constraint_error(text: &str, detail: &str) -> bool {
    let combined = format!("{text} {detail}").to_lowercase();
    UNIQUE_KEYWORDS.iter().any(|kw| combined.contains(kw))
}

/// `columns` と `values` の組すべてに一致する行の `row_number` を最大 `limit` 件返す。
///
/// 値は文字列として比較する。テーブルが空、または `row_number` か指定列が無い場合は空。
pub fn find_conflict_row_numbers(
    table: &Table,
    columns: &[String],
    values: &[String],
    limit: usize,
) -> Vec<u64> {
    if table.is_empty() || !table.has_column(ROW_NUMBER) {
        return Vec::new();
    }
    if columns.iter().any(|c| !table.has_column(c)) {
        return Vec::new();
    }
    let pairs: Vec<(&String, &String)> = columns.iter().zip(values).collect();
    if pairs.is_empty() {
        return Vec::new();
    }

    table
        .iter()
        .filter(|row| {
            pairs
                .iter()
                .all(|(c, v)| row.get_text(c).is_some_and(|text| text == **v))
        })
        .filter_map(|row| row.row_number())
        .take(limit)
        .collect()
}

/// 永続化時の一意制約違反を利用者向けの `UniqueConflict` に変換する。
///
/// 解析で何らかの情報（列・値・制約名）が得られれば、それを含むメッセージと詳細を返す。
/// 得られなければ生のエラー文字列だけを持つ汎用の衝突エラーを返す。
/// 常にエラーを返す。
pub fn unique_conflict_error(
    raw_error: &str,
    valid_table: &Table,
    detail: &str,
    extra_details: Option<Map<String, Value>>,
    row_limit: usize,
) -> ImportError {
    let Some(parsed) = parse_unique_constraint_error(raw_error, detail).filter(ConstraintDetail::has_signal)
    else {
        let details = match extra_details {
            Some(extra) if !extra.is_empty() => Value::Object(extra),
            _ => json!({ "error": raw_error }),
        };
        return ImportError::UniqueConflict {
            message: "Unique constraint conflict: import data duplicates existing keys \
                      (may include soft-deleted records)."
                .to_string(),
            details,
        };
    };

    let row_numbers = if !parsed.columns.is_empty() && !parsed.values.is_empty() {
        find_conflict_row_numbers(valid_table, &parsed.columns, &parsed.values, row_limit)
    } else {
        Vec::new()
    };

    let mut payload = Map::new();
    payload.insert("columns".into(), json!(parsed.columns));
    payload.insert("values".into(), json!(parsed.values));
    payload.insert("row_numbers".into(), json!(row_numbers));
    payload.insert("db_type".into(), json!(parsed.db_type));
    if let Some(name) = &parsed.constraint_name {
        payload.insert("constraint_name".into(), json!(name));
    }
    if let Some(extra) = extra_details {
        payload.extend(extra);
    }

    let conflict = conflict_label(&parsed);
    ImportError::UniqueConflict {
        message: format!(
            "Unique constraint conflict: {conflict} already exists (may include soft-deleted records)."
        ),
        details: Value::Object(payload),
    }
}

fn conflict_label(parsed: &ConstraintDetail) -> String {
    if !parsed.columns.is_empty() && !parsed.values.is_empty() {
        parsed
            .columns
            .iter()
            .zip(&parsed.values)
            .map(|(c, v)| format!("{c}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    } else if !parsed.values.is_empty() {
        parsed.values.join(", ")
    } else if !parsed.columns.is_empty() {
        parsed.columns.join(", ")
    } else {
        parsed
            .constraint_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }
}
