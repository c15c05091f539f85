//! ファイルシステム上のアーティファクトストア。
//!
//! ジョブ ID ごとに 1 ディレクトリを持ち、以下を保存する:
//!
//! ```text
//! {imports_dir}/{import_id}/
//!   original.<ext>   アップロード原本
//!   meta.json        ImportJob
//!   parsed.json      正規化済みの全行
//!   valid.json       検証を通過した行（0 行なら作成しない）
//!   errors.json      ValidationError の配列
//! ```
//!
//! すべての書き込みは一時ファイルへ書いてから rename する。

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::error::StorageError;
use crate::model::{ImportJob, ValidationError};
use crate::table::Table;

const HASH_CHUNK_BYTES: usize = 1024 * 1024;
const DEFAULT_EXPORT_NAME: &str = "export";

/// 時刻順にソート可能な新しいジョブ ID（UUIDv7）。
pub fn new_import_id() -> Uuid {
    Uuid::now_v7()
}

/// 現在の Unix 時刻（秒）。
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// 1 ジョブ分のアーティファクトのパス。ディスクには触れない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub root: PathBuf,
    /// 拡張子なしの原本パス。実ファイルは `original_with_extension` で決まる。
    pub original: PathBuf,
    pub meta: PathBuf,
    pub parsed: PathBuf,
    pub errors: PathBuf,
    pub valid: PathBuf,
}

impl ArtifactPaths {
    /// `ext` はドット付き（例: `.csv`）または空文字。
    pub fn original_with_extension(&self, ext: &str) -> PathBuf {
        let mut name = self.original.as_os_str().to_os_string();
        name.push(ext);
        PathBuf::from(name)
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    imports_dir: PathBuf,
    exports_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(config: &ImportConfig) -> Self {
        Self {
            imports_dir: config.imports_dir(),
            exports_dir: config.exports_dir(),
        }
    }

    pub fn imports_dir(&self) -> &Path {
        &self.imports_dir
    }

    pub fn exports_dir(&self) -> &Path {
        &self.exports_dir
    }

    pub fn paths_for(&self, import_id: Uuid) -> ArtifactPaths {
        let root = self.imports_dir.join(import_id.to_string());
        ArtifactPaths {
            original: root.join("original"),
            meta: root.join("meta.json"),
            parsed: root.join("parsed.json"),
            errors: root.join("errors.json"),
            valid: root.join("valid.json"),
            root,
        }
    }

    /// imports / exports ディレクトリを作成する。
    pub async fn ensure_dirs(&self) -> Result<(), StorageError> {
        for dir in [&self.imports_dir, &self.exports_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::io(dir, e))?;
        }
        Ok(())
    }

    pub async fn create_job_dir(&self, paths: &ArtifactPaths) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&paths.root)
            .await
            .map_err(|e| StorageError::io(&paths.root, e))
    }

    pub async fn write_meta(&self, paths: &ArtifactPaths, job: &ImportJob) -> Result<(), StorageError> {
        write_json_atomic(&paths.meta, job, "meta").await
    }

    /// `meta.json` を読む。パースできない場合は `CorruptMetadata`。
    pub async fn read_meta(&self, paths: &ArtifactPaths) -> Result<ImportJob, StorageError> {
        let bytes = tokio::fs::read(&paths.meta)
            .await
            .map_err(|e| StorageError::io(&paths.meta, e))?;
        serde_json::from_slice(&bytes).map_err(|source| StorageError::CorruptMetadata {
            path: paths.meta.clone(),
            source,
        })
    }

    pub async fn write_table(&self, path: &Path, table: &Table) -> Result<(), StorageError> {
        write_json_atomic(path, table, "table").await
    }

    pub async fn read_table(&self, path: &Path) -> Result<Table, StorageError> {
        read_json(path).await
    }

    pub async fn write_errors(
        &self,
        paths: &ArtifactPaths,
        errors: &[ValidationError],
    ) -> Result<(), StorageError> {
        write_json_atomic(&paths.errors, &errors, "errors").await
    }

    pub async fn read_errors(&self, paths: &ArtifactPaths) -> Result<Vec<ValidationError>, StorageError> {
        read_json(&paths.errors).await
    }

    /// ジョブディレクトリを削除する（エラーは無視）。
    pub async fn remove_job_dir(&self, paths: &ArtifactPaths) {
        if let Err(e) = tokio::fs::remove_dir_all(&paths.root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %paths.root.display(), error = %e, "failed to remove import directory");
            }
        }
    }

    /// exports ディレクトリ配下の安全な出力パスを返す。
    ///
    /// ディレクトリ成分（`/`, `\`, ドライブ指定）と `..` を取り除き、最後の成分だけを使う。
    /// 何も残らない場合は `export` を使う。
    pub async fn create_export_path(&self, filename: &str) -> Result<PathBuf, StorageError> {
        self.ensure_dirs().await?;
        Ok(self.exports_dir.join(sanitize_filename(filename)))
    }

    /// エクスポートファイルを削除する（ダウンロード後の後始末用、エラーは無視）。
    pub async fn delete_export_file(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to delete export file");
            }
        }
    }

    /// `created_at` が TTL を過ぎたジョブディレクトリを削除し、削除数を返す。
    ///
    /// メタデータが読めないディレクトリは常に期限切れとみなす。
    /// 個別ディレクトリの削除失敗は無視する。
    pub async fn cleanup_expired(&self, ttl_hours: u64) -> Result<usize, StorageError> {
        let ttl_secs = i64::try_from(ttl_hours.saturating_mul(3600)).unwrap_or(i64::MAX);
        let cutoff = now_ts().saturating_sub(ttl_secs);

        let mut entries = match tokio::fs::read_dir(&self.imports_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::io(&self.imports_dir, e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.imports_dir, e))?
        {
            let dir = entry.path();
            if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let created_at = read_json::<ImportJob>(&dir.join("meta.json"))
                .await
                .map_or(0, |job| job.created_at);
            if created_at >= cutoff {
                continue;
            }
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "failed to remove expired import");
                }
            }
        }

        info!(removed, ttl_hours, "expired imports cleaned up");
        Ok(removed)
    }
}

/// アップロード原本などのファイルの SHA-256 を 16 進文字列で返す。
pub async fn sha256_file(path: &Path) -> Result<String, StorageError> {
    use sha2::{Digest, Sha256};

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// 利用者が指定したファイル名からパス成分を取り除く。
pub fn sanitize_filename(filename: &str) -> String {
    let last = filename
        .rsplit(['/', '\\', ':'])
        .next()
        .unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        DEFAULT_EXPORT_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// ファイルの存在確認。確認自体に失敗した場合はエラー。
pub async fn exists(path: &Path) -> Result<bool, StorageError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| StorageError::io(path, e))
}

async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    what: &'static str,
) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e))?;
    }

    let content = serde_json::to_vec_pretty(value)
        .map_err(|source| StorageError::Serialize { what, source })?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &content)
        .await
        .map_err(|e| StorageError::io(&tmp_path, e))?;

    // 同一ディレクトリ内の rename はアトミック
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StorageError::io(path, e))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| StorageError::CorruptArtifact {
        path: path.to_path_buf(),
        source,
    })
}
