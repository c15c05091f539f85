//! アップロード → 検証 → プレビュー → コミットの状態機械。
//!
//! ジョブの状態は `meta.json` にだけ保持し、各操作は checksum を提示された場合のみ
//! アーティファクトに触れる。コミットは `committed` を検出した時点で保存済みの結果を返し、
//! 永続化処理を二度呼ばない。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use staged_import_lock::{lock_key, release, try_acquire, LockClient, LockLease};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{normalize_extensions, normalize_mime_types, ImportConfig};
use crate::constraint::{is_unique_constraint_error, unique_conflict_error};
use crate::driver::PersistError;
use crate::error::{ImportError, StorageError};
use crate::model::{
    CommitRequest, CommitResponse, ImportErrorItem, ImportJob, ImportStatus, PreviewKind,
    PreviewResponse, PreviewRow, ValidateResponse,
};
use crate::parser::{extension_of, normalize_columns, SpreadsheetParser, TabularParser};
use crate::store::{exists, new_import_id, now_ts, sha256_file, ArtifactPaths, ArtifactStore};
use crate::table::Table;
use crate::validation::{validate, DbCheckSpec, RowValidator};

const DEFAULT_UPLOAD_NAME: &str = "upload";

/// ホスト側フレームワークから受け取るアップロード。
pub struct Upload<R> {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub reader: R,
}

impl<R> Upload<R> {
    pub fn new(filename: impl Into<String>, content_type: Option<&str>, reader: R) -> Self {
        Self {
            filename: Some(filename.into()),
            content_type: content_type.map(ToString::to_string),
            reader,
        }
    }
}

/// アップロードごとの検証オプション。
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// 元の列名 → 正規化後の列名。
    pub column_aliases: HashMap<String, String>,
    /// ファイル内で重複を許さない列。
    pub unique_fields: Vec<String>,
    pub db_checks: Vec<DbCheckSpec>,
    pub allow_overwrite: bool,
    /// `None` なら `ImportConfig` の値を使う。空リストは制限なし。
    pub allowed_extensions: Option<Vec<String>>,
    pub allowed_mime_types: Option<Vec<String>>,
}

/// 有効行テーブルを永続化する呼び出し側の処理。DB ハンドルは実装側が保持する。
#[async_trait]
pub trait Persister: Send + Sync {
    /// 永続化の直前に呼ばれる。未確定のトランザクション状態を破棄する。
    /// 失敗は警告ログのみで無視される。
    async fn rollback(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// 登録した行数を返す。
    async fn persist(&self, valid: &Table, allow_overwrite: bool) -> Result<u64, PersistError>;
}

pub struct ImportService {
    config: ImportConfig,
    store: ArtifactStore,
    parser: Arc<dyn TabularParser>,
    lock: Option<Arc<dyn LockClient>>,
}

impl ImportService {
    pub fn new(mut config: ImportConfig) -> Self {
        config.normalize();
        let store = ArtifactStore::new(&config);
        Self {
            config,
            store,
            parser: Arc::new(SpreadsheetParser),
            lock: None,
        }
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn TabularParser>) -> Self {
        self.parser = parser;
        self
    }

    /// コミット時の分散ロックを有効にする。
    #[must_use]
    pub fn with_lock_client(mut self, lock: Arc<dyn LockClient>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// アップロードを保存・パース・検証し、checksum 付きの受付結果を返す。
    ///
    /// パースに失敗した場合はジョブディレクトリごと削除する。
    /// パース成功後の失敗ではアーティファクトを残す。
    pub async fn upload_parse_validate<R>(
        &self,
        upload: Upload<R>,
        validator: &dyn RowValidator,
        options: &UploadOptions,
    ) -> Result<ValidateResponse, ImportError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let filename = upload
            .filename
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_UPLOAD_NAME)
            .to_string();
        let content_type = upload
            .content_type
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(ToString::to_string);
        let ext = extension_of(&filename);
        self.check_media(&ext, content_type.as_deref(), options)?;

        let import_id = new_import_id();
        let paths = self.store.paths_for(import_id);
        self.store.create_job_dir(&paths).await?;

        let original = paths.original_with_extension(&ext);
        let (job, parsed) = match self
            .receive_and_parse(import_id, &paths, &original, filename, content_type, upload.reader, options)
            .await
        {
            Ok(staged) => staged,
            Err(e) => {
                warn!(import_id = %import_id, error = %e, "upload rejected, removing import directory");
                self.store.remove_job_dir(&paths).await;
                return Err(e);
            }
        };

        self.validate_and_stage(job, &paths, &parsed, validator, options)
            .await
    }

    fn check_media(
        &self,
        ext: &str,
        content_type: Option<&str>,
        options: &UploadOptions,
    ) -> Result<(), ImportError> {
        let extensions = options
            .allowed_extensions
            .as_ref()
            .map_or_else(|| self.config.allowed_extensions.clone(), normalize_extensions);
        if !extensions.is_empty() && !extensions.iter().any(|e| e == ext) {
            let shown = if ext.is_empty() { "(none)" } else { ext };
            return Err(ImportError::UnsupportedMediaType(format!(
                "file extension {shown} is not allowed"
            )));
        }

        let mime_types = options
            .allowed_mime_types
            .as_ref()
            .map_or_else(|| self.config.allowed_mime_types.clone(), normalize_mime_types);
        if let Some(content_type) = content_type {
            // `text/csv; charset=utf-8` のようなパラメータは比較対象外
            let essence = content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_lowercase();
            if !mime_types.is_empty() && !essence.is_empty() && !mime_types.contains(&essence) {
                return Err(ImportError::UnsupportedMediaType(format!(
                    "content type {essence} is not allowed"
                )));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn receive_and_parse<R>(
        &self,
        import_id: Uuid,
        paths: &ArtifactPaths,
        original: &Path,
        filename: String,
        content_type: Option<String>,
        reader: R,
        options: &UploadOptions,
    ) -> Result<(ImportJob, Table), ImportError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let size_bytes = self.write_original(original, reader).await?;
        let checksum = sha256_file(original).await?;
        info!(import_id = %import_id, filename = %filename, size_bytes, "upload received");

        let job = ImportJob {
            import_id,
            filename: filename.clone(),
            content_type,
            checksum,
            size_bytes,
            created_at: now_ts(),
            status: ImportStatus::Uploaded,
            total_rows: None,
            valid_rows: None,
            error_rows: None,
            committed_at: None,
            imported_rows: None,
            commit_failed_at: None,
            commit_error: None,
        };
        self.store.write_meta(paths, &job).await?;

        let parser = Arc::clone(&self.parser);
        let path = original.to_path_buf();
        let table = tokio::task::spawn_blocking(move || parser.parse(&path, &filename))
            .await
            .map_err(|e| ImportError::Parse(format!("parser task failed: {e}")))?
            .map_err(|e| ImportError::Parse(e.to_string()))?;

        let table = normalize_columns(table, &options.column_aliases);
        self.store.write_table(&paths.parsed, &table).await?;
        Ok((job, table))
    }

    /// 上限サイズを確認しながらチャンク単位で原本を書き込む。
    async fn write_original<R>(&self, path: &Path, mut reader: R) -> Result<u64, ImportError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let limit = self.config.max_upload_bytes();
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        let mut buf = vec![0u8; self.config.upload_chunk_bytes.max(1)];
        let mut written: u64 = 0;
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| StorageError::io(path, e))?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > limit {
                return Err(ImportError::PayloadTooLarge {
                    limit_mb: self.config.max_upload_mb,
                });
            }
            file.write_all(&buf[..n])
                .await
                .map_err(|e| StorageError::io(path, e))?;
        }
        file.flush().await.map_err(|e| StorageError::io(path, e))?;
        Ok(written)
    }

    async fn validate_and_stage(
        &self,
        mut job: ImportJob,
        paths: &ArtifactPaths,
        parsed: &Table,
        validator: &dyn RowValidator,
        options: &UploadOptions,
    ) -> Result<ValidateResponse, ImportError> {
        let outcome = validate(
            parsed,
            validator,
            &options.unique_fields,
            &options.db_checks,
            options.allow_overwrite,
        )
        .await?;

        self.store.write_errors(paths, &outcome.errors).await?;
        if !outcome.valid.is_empty() {
            self.store.write_table(&paths.valid, &outcome.valid).await?;
        }

        let total_rows = parsed.len() as u64;
        let valid_rows = outcome.valid.len() as u64;
        let error_rows = outcome.error_rows() as u64;
        job.status = ImportStatus::Validated;
        job.total_rows = Some(total_rows);
        job.valid_rows = Some(valid_rows);
        job.error_rows = Some(error_rows);
        self.store.write_meta(paths, &job).await?;

        info!(
            import_id = %job.import_id,
            total_rows,
            valid_rows,
            error_rows,
            "import validated"
        );

        Ok(ValidateResponse {
            import_id: job.import_id,
            checksum: job.checksum,
            total_rows,
            valid_rows,
            error_rows,
            errors: outcome
                .errors
                .iter()
                .take(self.config.error_preview_limit)
                .map(ImportErrorItem::from)
                .collect(),
        })
    }

    /// 検証済みデータの 1 ページ分を返す。`page` は 1 始まり。
    pub async fn preview(
        &self,
        import_id: Uuid,
        checksum: &str,
        page: usize,
        page_size: usize,
        kind: PreviewKind,
    ) -> Result<PreviewResponse, ImportError> {
        if page < 1 {
            return Err(ImportError::InvalidArgument("page must be >= 1".into()));
        }
        if page_size < 1 || page_size > self.config.max_page_size {
            return Err(ImportError::InvalidArgument(format!(
                "page_size must be between 1 and {}",
                self.config.max_page_size
            )));
        }

        let paths = self.store.paths_for(import_id);
        let job = self.load_job(import_id, &paths).await?;
        if job.checksum != checksum {
            return Err(ImportError::ChecksumMismatch);
        }

        let artifact = match kind {
            PreviewKind::All => &paths.parsed,
            PreviewKind::Valid => &paths.valid,
        };
        let (total_rows, rows) = if exists(artifact).await? {
            let table = self.store.read_table(artifact).await?;
            let offset = (page - 1).saturating_mul(page_size);
            let rows = table
                .slice(offset, page_size)
                .iter()
                .map(|row| PreviewRow {
                    row_number: row.row_number().unwrap_or_default(),
                    data: row.data(),
                })
                .collect();
            (table.len() as u64, rows)
        } else {
            (0, Vec::new())
        };

        Ok(PreviewResponse {
            import_id,
            checksum: job.checksum,
            page,
            page_size,
            total_rows,
            rows,
        })
    }

    /// 検証済みの有効行を永続化する。
    ///
    /// 既に `committed` のジョブは保存済みの結果を返し、`persister` を呼ばない。
    /// ロッククライアントが設定されていれば `{lock_namespace}:lock:{import_id}` を保持した状態で実行する。
    pub async fn commit(
        &self,
        request: &CommitRequest,
        persister: &dyn Persister,
        lock_namespace: &str,
    ) -> Result<CommitResponse, ImportError> {
        if request.checksum.trim().is_empty() {
            return Err(ImportError::EmptyChecksum);
        }
        let paths = self.store.paths_for(request.import_id);
        let job = self.load_job(request.import_id, &paths).await?;
        if job.checksum != request.checksum {
            return Err(ImportError::ChecksumMismatch);
        }
        if !job.status.is_committable() {
            return Err(ImportError::InvalidStatus(job.status));
        }
        if job.status == ImportStatus::Committed {
            info!(import_id = %job.import_id, "import already committed, returning stored result");
            return Ok(stored_result(&job));
        }

        if exists(&paths.errors).await? {
            let errors = self.store.read_errors(&paths).await?;
            if !errors.is_empty() {
                return Err(ImportError::ValidationErrorsBlock {
                    errors: errors
                        .into_iter()
                        .take(self.config.error_preview_limit)
                        .collect(),
                });
            }
        }
        if !exists(&paths.valid).await? {
            return Err(ImportError::MissingValidatedData);
        }

        let Some(lock) = self.lock.as_deref() else {
            return self.persist_locked(request, &paths, persister).await;
        };

        let key = lock_key(lock_namespace, &request.import_id.to_string());
        let token = Uuid::now_v7().to_string();
        let Some(lease) = try_acquire(lock, &key, &token, self.config.lock_ttl()).await? else {
            warn!(import_id = %request.import_id, key = %key, "import commit already in progress");
            return Err(ImportError::ImportInProgress);
        };

        let result = self.persist_locked(request, &paths, persister).await;
        self.release_lock(lock, &lease).await;
        result
    }

    async fn release_lock(&self, lock: &dyn LockClient, lease: &LockLease) {
        match release(lock, lease, self.config.lock_release).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(key = %lease.key, "lock was not released: expired or held by another owner");
            }
            Err(e) => warn!(key = %lease.key, error = %e, "failed to release import lock"),
        }
    }

    async fn persist_locked(
        &self,
        request: &CommitRequest,
        paths: &ArtifactPaths,
        persister: &dyn Persister,
    ) -> Result<CommitResponse, ImportError> {
        // ロック取得までの間に別プロセスがコミットを終えている可能性がある
        let mut job = self.store.read_meta(paths).await?;
        if job.status == ImportStatus::Committed {
            info!(import_id = %job.import_id, "import committed concurrently, returning stored result");
            return Ok(stored_result(&job));
        }

        if let Err(e) = persister.rollback().await {
            warn!(import_id = %job.import_id, error = %e, "rollback before persist failed");
        }

        let valid = self.store.read_table(&paths.valid).await?;
        match persister.persist(&valid, request.allow_overwrite).await {
            Ok(imported_rows) => {
                let committed_at = now_ts();
                job.status = ImportStatus::Committed;
                job.committed_at = Some(committed_at);
                job.imported_rows = Some(imported_rows);
                job.commit_failed_at = None;
                job.commit_error = None;
                self.store.write_meta(paths, &job).await?;
                info!(import_id = %job.import_id, imported_rows, "import committed");
                Ok(CommitResponse {
                    import_id: job.import_id,
                    checksum: job.checksum,
                    status: ImportStatus::Committed,
                    imported_rows,
                    committed_at,
                })
            }
            Err(e) => Err(self.record_failure(job, paths, &valid, e).await),
        }
    }

    /// `commit_failed` を記録し、永続化エラーを分類する。
    async fn record_failure(
        &self,
        mut job: ImportJob,
        paths: &ArtifactPaths,
        valid: &Table,
        err: PersistError,
    ) -> ImportError {
        let text = err.to_string();
        job.status = ImportStatus::CommitFailed;
        job.commit_failed_at = Some(now_ts());
        job.commit_error = Some(text.clone());
        if let Err(e) = self.store.write_meta(paths, &job).await {
            warn!(import_id = %job.import_id, error = %e, "failed to record commit failure");
        }

        let info = err.driver_info();
        let detail = info.and_then(|i| i.detail()).unwrap_or_default();
        let unique = is_unique_constraint_error(&text, detail);
        warn!(import_id = %job.import_id, unique_conflict = unique, error = %text, "import commit failed");

        if unique {
            let extra = info.and_then(|i| i.extra_details());
            unique_conflict_error(&text, valid, detail, extra, self.config.conflict_row_limit)
        } else {
            ImportError::Persist(err)
        }
    }

    /// 期限切れのジョブディレクトリを削除する。
    pub async fn cleanup_expired(&self, ttl_hours: u64) -> Result<usize, ImportError> {
        Ok(self.store.cleanup_expired(ttl_hours).await?)
    }

    /// exports ディレクトリ配下の安全な出力パスを返す。
    pub async fn create_export_path(&self, filename: &str) -> Result<std::path::PathBuf, ImportError> {
        Ok(self.store.create_export_path(filename).await?)
    }

    async fn load_job(&self, import_id: Uuid, paths: &ArtifactPaths) -> Result<ImportJob, ImportError> {
        if !exists(&paths.meta).await? {
            return Err(ImportError::NotFoundOrExpired(import_id));
        }
        Ok(self.store.read_meta(paths).await?)
    }
}

fn stored_result(job: &ImportJob) -> CommitResponse {
    CommitResponse {
        import_id: job.import_id,
        checksum: job.checksum.clone(),
        status: ImportStatus::Committed,
        imported_rows: job.imported_rows.unwrap_or_default(),
        committed_at: job.committed_at.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::AcceptAll;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingPersister {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Persister for CountingPersister {
        async fn persist(&self, valid: &Table, _allow_overwrite: bool) -> Result<u64, PersistError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(valid.len() as u64)
        }
    }

    fn service(dir: &TempDir) -> ImportService {
        ImportService::new(ImportConfig::with_base_dir(dir.path()))
    }

    async fn upload(svc: &ImportService, body: &'static [u8]) -> ValidateResponse {
        svc.upload_parse_validate(
            Upload::new("users.csv", Some("text/csv"), body),
            &AcceptAll,
            &UploadOptions::default(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_check_media_strips_parameters() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let options = UploadOptions::default();
        assert!(svc
            .check_media(".csv", Some("text/csv; charset=utf-8"), &options)
            .is_ok());
        assert!(svc.check_media(".csv", None, &options).is_ok());
        assert!(matches!(
            svc.check_media(".csv", Some("image/png"), &options),
            Err(ImportError::UnsupportedMediaType(_))
        ));
        assert!(matches!(
            svc.check_media(".txt", Some("text/plain"), &options),
            Err(ImportError::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn test_allow_lists_normalized_on_construction() {
        let dir = TempDir::new().unwrap();
        let config = ImportConfig {
            allowed_extensions: vec!["CSV".into(), " .XLSX ".into()],
            allowed_mime_types: vec![" Text/CSV ".into()],
            ..ImportConfig::with_base_dir(dir.path())
        };
        let svc = ImportService::new(config);
        let options = UploadOptions::default();
        assert_eq!(svc.config().allowed_extensions, vec![".csv", ".xlsx"]);
        assert!(svc.check_media(".csv", Some("text/csv"), &options).is_ok());
        assert!(svc.check_media(".xlsx", None, &options).is_ok());
    }

    #[test]
    fn test_empty_allow_lists_disable_checks() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let options = UploadOptions {
            allowed_extensions: Some(Vec::new()),
            allowed_mime_types: Some(Vec::new()),
            ..UploadOptions::default()
        };
        assert!(svc.check_media(".txt", Some("image/png"), &options).is_ok());
    }

    #[tokio::test]
    async fn test_upload_writes_artifacts() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let resp = upload(&svc, b"name\nA\nB\n").await;

        let paths = svc.store().paths_for(resp.import_id);
        assert!(paths.original_with_extension(".csv").exists());
        assert!(paths.parsed.exists());
        assert!(paths.valid.exists());
        assert!(paths.errors.exists());
        let job = svc.store().read_meta(&paths).await.unwrap();
        assert_eq!(job.status, ImportStatus::Validated);
        assert_eq!(job.total_rows, Some(2));
        assert_eq!(job.checksum, resp.checksum);
        assert_eq!(job.size_bytes, 9);
    }

    #[tokio::test]
    async fn test_zero_valid_rows_skips_valid_artifact() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let resp = upload(&svc, b"name\n").await;
        assert_eq!(resp.total_rows, 0);

        let paths = svc.store().paths_for(resp.import_id);
        assert!(!paths.valid.exists());
        assert!(paths.errors.exists());

        let persister = CountingPersister { calls: AtomicUsize::new(0) };
        let request = CommitRequest {
            import_id: resp.import_id,
            checksum: resp.checksum,
            allow_overwrite: false,
        };
        let err = svc.commit(&request, &persister, "import").await.unwrap_err();
        assert!(matches!(err, ImportError::MissingValidatedData));
        assert_eq!(persister.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_commit_rejects_uploaded_status() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let resp = upload(&svc, b"name\nA\n").await;

        let paths = svc.store().paths_for(resp.import_id);
        let mut job = svc.store().read_meta(&paths).await.unwrap();
        job.status = ImportStatus::Uploaded;
        svc.store().write_meta(&paths, &job).await.unwrap();

        let persister = CountingPersister { calls: AtomicUsize::new(0) };
        let request = CommitRequest {
            import_id: resp.import_id,
            checksum: resp.checksum,
            allow_overwrite: false,
        };
        let err = svc.commit(&request, &persister, "import").await.unwrap_err();
        assert!(matches!(err, ImportError::InvalidStatus(ImportStatus::Uploaded)));
    }

    #[tokio::test]
    async fn test_commit_empty_checksum() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let persister = CountingPersister { calls: AtomicUsize::new(0) };
        let request = CommitRequest {
            import_id: Uuid::now_v7(),
            checksum: "  ".into(),
            allow_overwrite: false,
        };
        let err = svc.commit(&request, &persister, "import").await.unwrap_err();
        assert!(matches!(err, ImportError::EmptyChecksum));
    }

    #[tokio::test]
    async fn test_preview_argument_checks() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let id = Uuid::now_v7();
        for (page, size) in [(0, 10), (1, 0), (1, 501)] {
            let err = svc
                .preview(id, "x", page, size, PreviewKind::All)
                .await
                .unwrap_err();
            assert!(matches!(err, ImportError::InvalidArgument(_)), "{page} {size}");
        }
        let err = svc.preview(id, "x", 1, 10, PreviewKind::All).await.unwrap_err();
        assert!(matches!(err, ImportError::NotFoundOrExpired(_)));
    }
}
