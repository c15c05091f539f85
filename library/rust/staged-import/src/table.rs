//! 行指向のインメモリテーブル。
//!
//! パース結果・有効行・プレビューのすべてがこの型を経由する。
//! 各行の先頭列は 1 始まりの `row_number` で、後続のすべての成果物で不変。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 行番号列の列名。
pub const ROW_NUMBER: &str = "row_number";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// 列と行から構築する。列数に満たない行は null で埋め、超過分は切り捨てる。
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn rename_column(&mut self, from: &str, to: &str) {
        if let Some(idx) = self.column_index(from) {
            self.columns[idx] = to.to_string();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(move |values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    /// `row_number` 列の値を行順に返す。列が無い場合は `None`。
    pub fn row_numbers(&self) -> Option<Vec<u64>> {
        self.column_index(ROW_NUMBER)?;
        Some(self.iter().filter_map(|r| r.row_number()).collect())
    }

    /// 指定された行番号を持つ行を除いたテーブルを返す。
    ///
    /// `row_number` 列が無い場合は何も除外しない。
    pub fn without_row_numbers(&self, excluded: &HashSet<u64>) -> Self {
        if excluded.is_empty() || !self.has_column(ROW_NUMBER) {
            return self.clone();
        }
        let rows = self
            .iter()
            .filter(|r| r.row_number().is_none_or(|n| !excluded.contains(&n)))
            .map(|r| r.values.to_vec())
            .collect();
        Self {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// `offset` 行目から最大 `limit` 行を切り出す。
    pub fn slice(&self, offset: usize, limit: usize) -> Self {
        let rows = self.rows.iter().skip(offset).take(limit).cloned().collect();
        Self {
            columns: self.columns.clone(),
            rows,
        }
    }
}

/// テーブルの 1 行への参照。
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> RowRef<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    /// セルを文字列として取得する。null または列が無い場合は `None`。
    pub fn get_text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(cell_text)
    }

    pub fn row_number(&self) -> Option<u64> {
        match self.get(ROW_NUMBER)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// `row_number` を除いた列名→値のマップ。
    pub fn data(&self) -> Map<String, Value> {
        self.columns
            .iter()
            .zip(self.values)
            .filter(|(c, _)| c.as_str() != ROW_NUMBER)
            .map(|(c, v)| (c.clone(), v.clone()))
            .collect()
    }
}

/// セル値の文字列表現。ドライバが報告する値は常に文字列なので、照合はこの表現で行う。
pub fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Table {
        Table::from_rows(
            vec![ROW_NUMBER.into(), "email".into(), "age".into()],
            vec![
                vec![json!(1), json!("a@example.com"), json!(30)],
                vec![json!(2), json!("b@example.com"), Value::Null],
                vec![json!(3), json!("c@example.com")],
            ],
        )
    }

    #[test]
    fn test_short_rows_are_padded_with_null() {
        let table = sample();
        assert_eq!(table.rows()[2].len(), 3);
        assert_eq!(table.rows()[2][2], Value::Null);
    }

    #[test]
    fn test_row_numbers() {
        assert_eq!(sample().row_numbers(), Some(vec![1, 2, 3]));
        let no_rn = Table::new(vec!["email".into()]);
        assert_eq!(no_rn.row_numbers(), None);
    }

    #[test]
    fn test_without_row_numbers() {
        let filtered = sample().without_row_numbers(&HashSet::from([2]));
        assert_eq!(filtered.row_numbers(), Some(vec![1, 3]));
    }

    #[test]
    fn test_without_row_numbers_passes_through_when_column_missing() {
        let table = Table::from_rows(vec!["email".into()], vec![vec![json!("x")]]);
        let filtered = table.without_row_numbers(&HashSet::from([1]));
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn test_slice() {
        let page = sample().slice(1, 5);
        assert_eq!(page.row_numbers(), Some(vec![2, 3]));
        assert!(sample().slice(10, 5).is_empty());
    }

    #[test]
    fn test_get_text_stringifies_numbers() {
        let table = sample();
        let row = table.iter().next().unwrap();
        assert_eq!(row.get_text("age").as_deref(), Some("30"));
        assert_eq!(row.get_text("email").as_deref(), Some("a@example.com"));
        assert_eq!(row.get_text("missing"), None);
    }

    #[test]
    fn test_data_excludes_row_number() {
        let table = sample();
        let data = table.iter().next().unwrap().data();
        assert!(!data.contains_key(ROW_NUMBER));
        assert_eq!(data["email"], json!("a@example.com"));
    }

    #[test]
    fn test_json_roundtrip() {
        let table = sample();
        let text = serde_json::to_string(&table).unwrap();
        let back: Table = serde_json::from_str(&text).unwrap();
        assert_eq!(back, table);
    }
}
