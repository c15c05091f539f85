//! CSV / Excel のパースと列名の正規化。
//!
//! パース結果の先頭列には 1 始まりの `row_number` を付与する。
//! 空文字のセルは null、すべてのセルが空の行は読み飛ばす。

use std::collections::HashMap;
use std::path::Path;

use calamine::{open_workbook_auto, Data, ExcelDateTime, Reader};
use chrono::NaiveTime;
use serde_json::{Number, Value};

use crate::table::{Table, ROW_NUMBER};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(String),

    #[error("file has no header row")]
    MissingHeader,

    #[error("workbook has no worksheet")]
    NoWorksheet,

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("spreadsheet error: {0}")]
    Spreadsheet(#[from] calamine::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 保存済みのアップロード原本を行テーブルに変換する。
///
/// 同期処理。呼び出し側は blocking プール上で実行すること。
pub trait TabularParser: Send + Sync {
    fn parse(&self, path: &Path, filename: &str) -> Result<Table, ParseError>;
}

/// `csv` と `calamine` による標準パーサー。拡張子で形式を判定する。
#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetParser;

impl TabularParser for SpreadsheetParser {
    fn parse(&self, path: &Path, filename: &str) -> Result<Table, ParseError> {
        let ext = extension_of(filename);
        match ext.as_str() {
            ".csv" => parse_csv(path),
            ".xlsx" | ".xlsm" | ".xls" | ".xlsb" | ".ods" => parse_workbook(path),
            _ => Err(ParseError::UnsupportedExtension(ext)),
        }
    }
}

/// 小文字化したドット付き拡張子。拡張子が無ければ空文字。
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

fn parse_csv(path: &Path) -> Result<Table, ParseError> {
    let bytes = std::fs::read(path)?;
    let content = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut table = new_table(headers)?;

    let mut row_number: u64 = 0;
    for record in reader.records() {
        let record = record?;
        let cells: Vec<Value> = record.iter().map(text_cell).collect();
        if cells.iter().all(Value::is_null) {
            continue;
        }
        row_number += 1;
        push_numbered(&mut table, row_number, cells);
    }
    Ok(table)
}

fn parse_workbook(path: &Path) -> Result<Table, ParseError> {
    let mut workbook = open_workbook_auto(path)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(ParseError::NoWorksheet)??;

    let mut rows = range.rows();
    let headers: Vec<String> = rows
        .next()
        .ok_or(ParseError::MissingHeader)?
        .iter()
        .map(|c| c.to_string().trim().to_string())
        .collect();
    let mut table = new_table(headers)?;

    let mut row_number: u64 = 0;
    for row in rows {
        let cells: Vec<Value> = row.iter().map(workbook_cell).collect();
        if cells.iter().all(Value::is_null) {
            continue;
        }
        row_number += 1;
        push_numbered(&mut table, row_number, cells);
    }
    Ok(table)
}

fn new_table(headers: Vec<String>) -> Result<Table, ParseError> {
    if headers.iter().all(String::is_empty) {
        return Err(ParseError::MissingHeader);
    }
    let mut columns = Vec::with_capacity(headers.len() + 1);
    columns.push(ROW_NUMBER.to_string());
    columns.extend(headers);
    Ok(Table::new(columns))
}

fn push_numbered(table: &mut Table, row_number: u64, cells: Vec<Value>) {
    let mut row = Vec::with_capacity(cells.len() + 1);
    row.push(Value::from(row_number));
    row.extend(cells);
    table.push_row(row);
}

fn text_cell(raw: &str) -> Value {
    if raw.trim().is_empty() {
        Value::Null
    } else {
        Value::String(raw.to_string())
    }
}

fn workbook_cell(cell: &Data) -> Value {
    match cell {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::Int(i) => Value::from(*i),
        Data::Float(f) => number_cell(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => text_cell(s),
        Data::DateTime(dt) => datetime_cell(dt),
    }
}

/// Excel は整数も浮動小数で保持するため、整数値は整数として扱う（`7.0` → `7`）。
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn number_cell(f: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if f.fract() == 0.0 && f.abs() < MAX_EXACT {
        return Value::from(f as i64);
    }
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

/// 日付は `YYYY-MM-DD`、時刻を含む場合は `YYYY-MM-DDTHH:MM:SS`。
fn datetime_cell(dt: &ExcelDateTime) -> Value {
    if dt.is_duration() {
        return number_cell(dt.as_f64());
    }
    match dt.as_datetime() {
        Some(ts) if ts.time() == NaiveTime::MIN => {
            Value::String(ts.date().format("%Y-%m-%d").to_string())
        }
        Some(ts) => Value::String(ts.format("%Y-%m-%dT%H:%M:%S").to_string()),
        None => number_cell(dt.as_f64()),
    }
}

/// 列名の別名マップに従ってヘッダーを正規化する。
///
/// ヘッダーは trim し、マップにある名前だけを置き換える。`row_number` は変更しない。
pub fn normalize_columns(mut table: Table, aliases: &HashMap<String, String>) -> Table {
    let renames: Vec<(String, String)> = table
        .columns()
        .iter()
        .filter(|c| c.as_str() != ROW_NUMBER)
        .filter_map(|c| {
            let trimmed = c.trim();
            let target = aliases.get(trimmed).map_or(trimmed, String::as_str);
            (target != c.as_str()).then(|| (c.clone(), target.to_string()))
        })
        .collect();
    for (from, to) in renames {
        table.rename_column(&from, &to);
    }
    table
}
