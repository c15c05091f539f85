use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use staged_import_lock::LockReleaseMode;

/// インポート処理の設定。
///
/// 環境変数の解決はプロセス起動時に呼び出し側が `from_env` で一度だけ行う。
/// コア側は環境変数を読まない。
#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_imports_dirname")]
    pub imports_dirname: String,
    #[serde(default = "default_exports_dirname")]
    pub exports_dirname: String,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
    #[serde(default = "default_upload_chunk_bytes")]
    pub upload_chunk_bytes: usize,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default)]
    pub lock_release: LockReleaseMode,
    #[serde(default = "default_error_preview_limit")]
    pub error_preview_limit: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    #[serde(default = "default_conflict_row_limit")]
    pub conflict_row_limit: usize,
}

fn default_base_dir() -> PathBuf {
    std::env::temp_dir().join("import_export")
}

fn default_imports_dirname() -> String {
    "imports".to_string()
}

fn default_exports_dirname() -> String {
    "exports".to_string()
}

fn default_allowed_extensions() -> Vec<String> {
    normalize_extensions([".csv", ".xlsx", ".xlsm", ".xls"])
}

fn default_allowed_mime_types() -> Vec<String> {
    normalize_mime_types([
        "text/csv",
        "application/csv",
        "text/plain",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "application/vnd.ms-excel",
        "application/vnd.ms-excel.sheet.macroenabled.12",
    ])
}

fn default_max_upload_mb() -> u64 {
    20
}

fn default_upload_chunk_bytes() -> usize {
    1024 * 1024
}

fn default_lock_ttl_secs() -> u64 {
    300
}

fn default_error_preview_limit() -> usize {
    200
}

fn default_max_page_size() -> usize {
    500
}

fn default_conflict_row_limit() -> usize {
    50
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            imports_dirname: default_imports_dirname(),
            exports_dirname: default_exports_dirname(),
            allowed_extensions: default_allowed_extensions(),
            allowed_mime_types: default_allowed_mime_types(),
            max_upload_mb: default_max_upload_mb(),
            upload_chunk_bytes: default_upload_chunk_bytes(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_release: LockReleaseMode::default(),
            error_preview_limit: default_error_preview_limit(),
            max_page_size: default_max_page_size(),
            conflict_row_limit: default_conflict_row_limit(),
        }
    }
}

impl ImportConfig {
    /// 指定ディレクトリをルートとするデフォルト設定。
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// YAML ファイルから設定を読み込む。
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path, e))?;
        let mut config: Self = serde_yaml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        config.normalize();
        Ok(config)
    }

    /// `{prefix}_BASE_DIR` などの環境変数から設定を組み立てる。
    pub fn from_env(prefix: &str) -> Self {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// 任意の参照関数から設定を組み立てる。空文字の値は未設定として扱う。
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{prefix}_{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();
        if let Some(base) = get("BASE_DIR").or_else(|| get("TMP_DIR")) {
            config.base_dir = PathBuf::from(base);
        }
        if let Some(name) = get("IMPORTS_DIRNAME") {
            config.imports_dirname = name;
        }
        if let Some(name) = get("EXPORTS_DIRNAME") {
            config.exports_dirname = name;
        }
        if let Some(list) = get("ALLOWED_EXTENSIONS") {
            config.allowed_extensions = normalize_extensions(list.split(','));
        }
        if let Some(list) = get("ALLOWED_MIME_TYPES") {
            config.allowed_mime_types = normalize_mime_types(list.split(','));
        }
        config
    }

    /// 拡張子と MIME タイプのリストを正規化する。`ImportService::new` からも呼ばれる。
    pub fn normalize(&mut self) {
        self.allowed_extensions = normalize_extensions(&self.allowed_extensions);
        self.allowed_mime_types = normalize_mime_types(&self.allowed_mime_types);
    }

    pub fn imports_dir(&self) -> PathBuf {
        self.base_dir.join(&self.imports_dirname)
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.base_dir.join(&self.exports_dirname)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

/// 拡張子リストを正規化する（trim・小文字化・ドット付与・重複除去・ソート）。
pub fn normalize_extensions<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .filter_map(|s| {
            let v = s.as_ref().trim().to_lowercase();
            if v.is_empty() {
                None
            } else if v.starts_with('.') {
                Some(v)
            } else {
                Some(format!(".{v}"))
            }
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// MIME タイプリストを正規化する（trim・小文字化・重複除去・ソート）。
pub fn normalize_mime_types<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
