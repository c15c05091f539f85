//! 検証パイプライン。
//!
//! 1. 呼び出し側の `RowValidator`（必須項目・形式・業務ルール）
//! 2. `DbCheckSpec` による既存データとの照合
//! 3. `unique_fields` によるファイル内重複の検出
//!
//! いずれかの段階でエラーになった行は有効行テーブルから除外する。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::ImportError;
use crate::model::{error_type, ValidationError};
use crate::table::{RowRef, Table, ROW_NUMBER};

/// キー列の値の組。
pub type KeyTuple = Vec<String>;

const DEFAULT_DB_CHECK_MESSAGE: &str = "DB check failed";

/// 業務側の行検証。`(有効行候補, エラー)` を返す。
///
/// 有効行候補には `row_number` 列を残すこと。
#[async_trait]
pub trait RowValidator: Send + Sync {
    async fn validate(
        &self,
        table: &Table,
        allow_overwrite: bool,
    ) -> anyhow::Result<(Table, Vec<ValidationError>)>;
}

/// すべての行をそのまま有効とする検証器。
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl RowValidator for AcceptAll {
    async fn validate(
        &self,
        table: &Table,
        _allow_overwrite: bool,
    ) -> anyhow::Result<(Table, Vec<ValidationError>)> {
        Ok((table.clone(), Vec::new()))
    }
}

/// 既存データとのキー照合。DB ハンドルは実装側が保持する。
#[async_trait]
pub trait DbCheck: Send + Sync {
    /// 衝突したキーだけを返す。
    async fn check(
        &self,
        keys: &[KeyTuple],
        allow_overwrite: bool,
    ) -> anyhow::Result<HashMap<KeyTuple, DbConflict>>;
}

/// 衝突したキーの情報。未指定の項目は `DbCheckSpec` の既定値を使う。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbConflict {
    pub message: Option<String>,
    pub value: Option<Value>,
    pub details: Option<Value>,
}

#[derive(Clone)]
pub struct DbCheckSpec {
    pub key_fields: Vec<String>,
    pub check: Arc<dyn DbCheck>,
    /// 未指定なら先頭のキー列。
    pub field: Option<String>,
    pub message: String,
    pub kind: String,
}

impl DbCheckSpec {
    pub fn new(key_fields: Vec<String>, check: Arc<dyn DbCheck>) -> Self {
        Self {
            key_fields,
            check,
            field: None,
            message: DEFAULT_DB_CHECK_MESSAGE.to_string(),
            kind: error_type::DB_CHECK.to_string(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    fn error_field(&self) -> Option<String> {
        self.field
            .clone()
            .or_else(|| self.key_fields.first().cloned())
    }
}

impl std::fmt::Debug for DbCheckSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCheckSpec")
            .field("key_fields", &self.key_fields)
            .field("field", &self.field)
            .field("message", &self.message)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutcome {
    pub valid: Table,
    pub errors: Vec<ValidationError>,
}

impl ValidationOutcome {
    /// エラーを持つ行の数（`row_number > 0` の重複を除いた数）。
    pub fn error_rows(&self) -> usize {
        error_row_numbers(&self.errors).len()
    }
}

/// 検証パイプラインを実行する。
pub async fn validate(
    table: &Table,
    validator: &dyn RowValidator,
    unique_fields: &[String],
    db_checks: &[DbCheckSpec],
    allow_overwrite: bool,
) -> Result<ValidationOutcome, ImportError> {
    if table.is_empty() {
        return Ok(ValidationOutcome {
            valid: Table::new(table.columns().to_vec()),
            errors: Vec::new(),
        });
    }

    let (candidate, mut errors) = validator
        .validate(table, allow_overwrite)
        .await
        .map_err(ImportError::Validator)?;

    if !db_checks.is_empty() {
        errors.extend(run_db_checks(table, db_checks, allow_overwrite).await?);
    }
    if !unique_fields.is_empty() {
        errors.extend(collect_infile_duplicates(table, unique_fields));
    }

    let error_rows = error_row_numbers(&errors);
    if let Some(known) = table.row_numbers() {
        let known: HashSet<u64> = known.into_iter().collect();
        let unknown = error_rows.iter().filter(|n| !known.contains(n)).count();
        if unknown > 0 {
            warn!(unknown, "validation errors reference rows not present in the table");
        }
    }

    Ok(ValidationOutcome {
        valid: candidate.without_row_numbers(&error_rows),
        errors,
    })
}

/// `row_number > 0` のエラー行番号の集合。
pub fn error_row_numbers(errors: &[ValidationError]) -> HashSet<u64> {
    errors
        .iter()
        .map(|e| e.row_number)
        .filter(|n| *n > 0)
        .collect()
}

/// キー列の値の組 → 行番号リスト。空のキー要素を含む行は対象外。
pub fn build_key_to_row_numbers(table: &Table, key_fields: &[String]) -> BTreeMap<KeyTuple, Vec<u64>> {
    let mut map: BTreeMap<KeyTuple, Vec<u64>> = BTreeMap::new();
    if key_fields.is_empty() || table.is_empty() || !table.has_column(ROW_NUMBER) {
        return map;
    }
    if key_fields.iter().any(|f| !table.has_column(f)) {
        return map;
    }
    for row in table.iter() {
        let Some(row_number) = row.row_number() else {
            continue;
        };
        let key: KeyTuple = key_fields
            .iter()
            .map(|f| row.get_text(f).unwrap_or_default().trim().to_string())
            .collect();
        if key.iter().any(String::is_empty) {
            continue;
        }
        map.entry(key).or_default().push(row_number);
    }
    map
}

/// 衝突したキーごとに、そのキーを持つすべての行へエラーを付ける。
pub fn build_db_conflict_errors(
    key_to_row_numbers: &BTreeMap<KeyTuple, Vec<u64>>,
    conflicts: &HashMap<KeyTuple, DbConflict>,
    field: Option<&str>,
    default_message: &str,
    kind: &str,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for (key, row_numbers) in key_to_row_numbers {
        let Some(conflict) = conflicts.get(key) else {
            continue;
        };
        let message = conflict.message.as_deref().unwrap_or(default_message);
        let value = conflict.value.clone().unwrap_or_else(|| key_value(key));
        for &row_number in row_numbers {
            let mut error = ValidationError::new(row_number, message, kind).with_value(value.clone());
            error.field = field.map(ToString::to_string);
            error.details.clone_from(&conflict.details);
            errors.push(error);
        }
    }
    errors
}

fn key_value(key: &KeyTuple) -> Value {
    match key.as_slice() {
        [single] => Value::String(single.clone()),
        parts => json!(parts),
    }
}

async fn run_db_checks(
    table: &Table,
    specs: &[DbCheckSpec],
    allow_overwrite: bool,
) -> Result<Vec<ValidationError>, ImportError> {
    let mut errors = Vec::new();
    for spec in specs {
        let key_to_rows = build_key_to_row_numbers(table, &spec.key_fields);
        if key_to_rows.is_empty() {
            continue;
        }
        let keys: Vec<KeyTuple> = key_to_rows.keys().cloned().collect();
        let conflicts = spec
            .check
            .check(&keys, allow_overwrite)
            .await
            .map_err(ImportError::Validator)?;
        if conflicts.is_empty() {
            continue;
        }
        errors.extend(build_db_conflict_errors(
            &key_to_rows,
            &conflicts,
            spec.error_field().as_deref(),
            &spec.message,
            &spec.kind,
        ));
    }
    Ok(errors)
}

/// ファイル内の重複値を検出する。
///
/// 同じ値を持つ行は最初の出現も含めてすべてエラーにする。空値は対象外。
pub fn collect_infile_duplicates(table: &Table, unique_fields: &[String]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if table.is_empty() || !table.has_column(ROW_NUMBER) {
        return errors;
    }
    for field in unique_fields {
        if !table.has_column(field) {
            continue;
        }
        let mut counts: HashMap<String, usize> = HashMap::new();
        for value in table.iter().filter_map(|r| non_empty_text(&r, field)) {
            *counts.entry(value).or_default() += 1;
        }
        if counts.values().all(|c| *c < 2) {
            continue;
        }
        for row in table.iter() {
            let (Some(row_number), Some(value)) = (row.row_number(), non_empty_text(&row, field))
            else {
                continue;
            };
            if counts.get(&value).is_some_and(|c| *c > 1) {
                errors.push(
                    ValidationError::new(
                        row_number,
                        format!("Duplicate value for field {field}: {value}"),
                        error_type::INFILE_DUPLICATE,
                    )
                    .with_field(field.clone())
                    .with_value(value),
                );
            }
        }
    }
    errors
}

/// `values` に含まれる値を `field` に持つ行へ `db_conflict` エラーを付ける。
pub fn build_conflict_errors<I, S>(
    table: &Table,
    field: &str,
    values: I,
    reason: &str,
) -> Vec<ValidationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let conflict_values: HashSet<String> = values
        .into_iter()
        .map(|v| v.as_ref().to_string())
        .filter(|v| !v.trim().is_empty())
        .collect();
    if conflict_values.is_empty() || table.is_empty() || !table.has_column(field) {
        return Vec::new();
    }
    table
        .iter()
        .filter_map(|row| {
            let value = non_empty_text(&row, field)?;
            if !conflict_values.contains(&value) {
                return None;
            }
            Some(
                ValidationError::new(
                    row.row_number().unwrap_or(0),
                    format!("Conflict: {reason}; {field}={value}"),
                    error_type::DB_CONFLICT,
                )
                .with_field(field)
                .with_value(value),
            )
        })
        .collect()
}

fn non_empty_text(row: &RowRef<'_>, field: &str) -> Option<String> {
    row.get_text(field).filter(|v| !v.is_empty())
}

/// 検証エラーの収集器。
#[derive(Debug, Clone, Default)]
pub struct ErrorCollector {
    errors: Vec<ValidationError>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add(&mut self, row_number: u64, field: Option<&str>, message: impl Into<String>) {
        let mut error = ValidationError::new(row_number, message, error_type::VALIDATION);
        error.field = field.map(ToString::to_string);
        self.errors.push(error);
    }

    /// 1 行分の検証ヘルパーを返す。
    pub fn row<'a>(&'a mut self, row: RowRef<'a>) -> RowContext<'a> {
        RowContext {
            row_number: row.row_number().unwrap_or(0),
            collector: self,
            row,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<ValidationError> {
        self.errors
    }
}

/// 行単位の値取得とエラー登録。
pub struct RowContext<'a> {
    collector: &'a mut ErrorCollector,
    row_number: u64,
    row: RowRef<'a>,
}

impl RowContext<'_> {
    pub fn row_number(&self) -> u64 {
        self.row_number
    }

    /// trim 済みの文字列値。null や列が無い場合は空文字。
    pub fn get_str(&self, field: &str) -> String {
        self.row
            .get_text(field)
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>, kind: &str) {
        self.collector
            .push(ValidationError::new(self.row_number, message, kind).with_field(field));
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.collector.push(ValidationError {
            row_number: self.row_number,
            ..error
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table(rows: &[(u64, &str, &str)]) -> Table {
        Table::from_rows(
            vec![ROW_NUMBER.into(), "email".into(), "name".into()],
            rows.iter()
                .map(|(n, e, name)| {
                    let cell = |s: &str| if s.is_empty() { Value::Null } else { json!(s) };
                    vec![json!(n), cell(e), cell(name)]
                })
                .collect(),
        )
    }

    fn fields(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    /// email が空の行を required エラーにする検証器。
    struct RequireEmail;

    #[async_trait]
    impl RowValidator for RequireEmail {
        async fn validate(
            &self,
            table: &Table,
            _allow_overwrite: bool,
        ) -> anyhow::Result<(Table, Vec<ValidationError>)> {
            let mut collector = ErrorCollector::new();
            for row in table.iter() {
                let mut ctx = collector.row(row);
                if ctx.get_str("email").is_empty() {
                    ctx.add("email", "email is required", error_type::REQUIRED);
                }
            }
            let bad = error_row_numbers(collector.errors());
            Ok((table.without_row_numbers(&bad), collector.into_errors()))
        }
    }

    struct FailingValidator;

    #[async_trait]
    impl RowValidator for FailingValidator {
        async fn validate(
            &self,
            _table: &Table,
            _allow_overwrite: bool,
        ) -> anyhow::Result<(Table, Vec<ValidationError>)> {
            anyhow::bail!("validator crashed")
        }
    }

    /// 指定したキーを既存として報告する。
    struct ExistingKeys {
        existing: Vec<KeyTuple>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DbCheck for ExistingKeys {
        async fn check(
            &self,
            keys: &[KeyTuple],
            _allow_overwrite: bool,
        ) -> anyhow::Result<HashMap<KeyTuple, DbConflict>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(keys
                .iter()
                .filter(|k| self.existing.contains(k))
                .map(|k| (k.clone(), DbConflict::default()))
                .collect())
        }
    }

    #[tokio::test]
    async fn test_empty_table_short_circuits() {
        let outcome = validate(&table(&[]), &FailingValidator, &fields(&["email"]), &[], false)
            .await
            .unwrap();
        assert!(outcome.valid.is_empty());
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_flag_every_occurrence() {
        let input = table(&[
            (1, "a@example.com", "A"),
            (2, "b@example.com", "B"),
            (3, "a@example.com", "C"),
            (4, "", "D"),
            (5, "", "E"),
        ]);
        let outcome = validate(&input, &AcceptAll, &fields(&["email"]), &[], false)
            .await
            .unwrap();

        let dup_rows: Vec<u64> = outcome.errors.iter().map(|e| e.row_number).collect();
        assert_eq!(dup_rows, vec![1, 3]);
        assert!(outcome
            .errors
            .iter()
            .all(|e| e.kind == error_type::INFILE_DUPLICATE));
        assert_eq!(
            outcome.errors[0].message,
            "Duplicate value for field email: a@example.com"
        );
        assert_eq!(outcome.valid.row_numbers(), Some(vec![2, 4, 5]));
    }

    #[tokio::test]
    async fn test_union_of_all_stages_is_excluded() {
        let input = table(&[
            (1, "", "A"),
            (2, "dup@example.com", "B"),
            (3, "dup@example.com", "C"),
            (4, "taken@example.com", "D"),
            (5, "ok@example.com", "E"),
        ]);
        let check = Arc::new(ExistingKeys {
            existing: vec![vec!["taken@example.com".to_string()]],
            calls: AtomicUsize::new(0),
        });
        let specs = vec![DbCheckSpec::new(fields(&["email"]), check.clone())
            .with_message("email already registered")];

        let outcome = validate(&input, &RequireEmail, &fields(&["email"]), &specs, false)
            .await
            .unwrap();

        assert_eq!(check.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.valid.row_numbers(), Some(vec![5]));
        assert_eq!(outcome.error_rows(), 4);

        let db_error = outcome
            .errors
            .iter()
            .find(|e| e.kind == error_type::DB_CHECK)
            .unwrap();
        assert_eq!(db_error.row_number, 4);
        assert_eq!(db_error.field.as_deref(), Some("email"));
        assert_eq!(db_error.message, "email already registered");
        assert_eq!(db_error.value, Some(json!("taken@example.com")));
    }

    #[tokio::test]
    async fn test_validator_error_is_propagated() {
        let err = validate(&table(&[(1, "a", "b")]), &FailingValidator, &[], &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Validator(_)));
    }

    #[tokio::test]
    async fn test_missing_row_number_passes_through() {
        let input = Table::from_rows(
            vec!["email".into()],
            vec![vec![json!("x")], vec![json!("x")]],
        );
        let outcome = validate(&input, &AcceptAll, &fields(&["email"]), &[], false)
            .await
            .unwrap();
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.valid.len(), 2);
    }

    #[test]
    fn test_build_key_to_row_numbers_skips_blank_parts() {
        let input = table(&[
            (1, "a@example.com", "A"),
            (2, "a@example.com", "A"),
            (3, "a@example.com", ""),
            (4, " b@example.com ", "B"),
        ]);
        let map = build_key_to_row_numbers(&input, &fields(&["email", "name"]));
        assert_eq!(map.len(), 2);
        assert_eq!(
            map[&fields(&["a@example.com", "A"])],
            vec![1, 2]
        );
        assert_eq!(map[&fields(&["b@example.com", "B"])], vec![4]);
        assert!(build_key_to_row_numbers(&input, &fields(&["phone"])).is_empty());
    }

    #[test]
    fn test_build_db_conflict_errors_uses_overrides() {
        let mut key_to_rows = BTreeMap::new();
        key_to_rows.insert(fields(&["a", "1"]), vec![2, 7]);
        key_to_rows.insert(fields(&["b", "2"]), vec![3]);
        let conflicts = HashMap::from([(
            fields(&["a", "1"]),
            DbConflict {
                message: Some("exists in tenant".into()),
                value: None,
                details: Some(json!({"id": 10})),
            },
        )]);
        let errors = build_db_conflict_errors(&key_to_rows, &conflicts, Some("code"), "default", "db_unique");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].row_number, 2);
        assert_eq!(errors[1].row_number, 7);
        assert_eq!(errors[0].message, "exists in tenant");
        assert_eq!(errors[0].value, Some(json!(["a", "1"])));
        assert_eq!(errors[0].details, Some(json!({"id": 10})));
        assert_eq!(errors[0].kind, "db_unique");
    }

    #[test]
    fn test_build_conflict_errors() {
        let input = table(&[(1, "a@example.com", "A"), (2, "b@example.com", "B")]);
        let errors = build_conflict_errors(&input, "email", ["b@example.com", " "], "already registered");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_number, 2);
        assert_eq!(errors[0].kind, error_type::DB_CONFLICT);
        assert_eq!(
            errors[0].message,
            "Conflict: already registered; email=b@example.com"
        );
    }

    #[test]
    fn test_row_context_get_str() {
        let input = table(&[(9, "  a@example.com ", "")]);
        let mut collector = ErrorCollector::new();
        let row = input.iter().next().unwrap();
        let mut ctx = collector.row(row);
        assert_eq!(ctx.row_number(), 9);
        assert_eq!(ctx.get_str("email"), "a@example.com");
        assert_eq!(ctx.get_str("name"), "");
        assert_eq!(ctx.get_str("missing"), "");
        ctx.add("name", "name is required", error_type::REQUIRED);
        collector.add(0, None, "header mismatch");
        let errors = collector.into_errors();
        assert_eq!(errors[0].row_number, 9);
        assert_eq!(errors[1].row_number, 0);
    }
}
