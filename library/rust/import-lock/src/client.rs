use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::LockError;

/// インポートのコミットを排他するためのキー・バリュー型ロッククライアント。
///
/// Redis の `SET NX PX` / `GET` / `DEL` と同じ意味論を持つ。
/// `set` は `only_if_absent` が true のとき、キーが未設定（または期限切れ）の場合のみ書き込み、
/// 書き込めたかどうかを返す。
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait LockClient: Send + Sync {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        only_if_absent: bool,
    ) -> Result<bool, LockError>;

    async fn get(&self, key: &str) -> Result<Option<String>, LockError>;

    /// キーを削除し、削除されたかどうかを返す。
    async fn delete(&self, key: &str) -> Result<bool, LockError>;

    /// 保存値が `expected` と一致する場合のみ削除する。
    ///
    /// デフォルト実装は GET と DEL の二往復で非アトミック。
    /// バックエンドがスクリプト等でアトミックに実行できる場合は上書きすること。
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        match self.get(key).await? {
            Some(current) if current == expected => self.delete(key).await,
            _ => Ok(false),
        }
    }
}

/// ロック解放の方式。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReleaseMode {
    /// GET で値を比較してから DEL する（ベストエフォート、競合あり）。
    #[default]
    CompareThenDelete,
    /// `compare_and_delete` を一度だけ呼ぶ。
    Atomic,
}

/// 取得済みのロック。`token` は取得ごとに一意な値。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: String,
}

/// `{namespace}:lock:{id}` 形式のロックキーを組み立てる。
pub fn lock_key(namespace: &str, id: &str) -> String {
    format!("{namespace}:lock:{id}")
}

/// `ttl` 付きでロックの取得を試みる。既に他者が保持している場合は `Ok(None)`。
pub async fn try_acquire(
    client: &dyn LockClient,
    key: &str,
    token: &str,
    ttl: Duration,
) -> Result<Option<LockLease>, LockError> {
    if client.set(key, token, ttl, true).await? {
        Ok(Some(LockLease {
            key: key.to_string(),
            token: token.to_string(),
        }))
    } else {
        Ok(None)
    }
}

/// 保存値がまだ自分の token と一致する場合のみロックを解放する。
///
/// 期限切れ後に別プロセスが再取得したロックを誤って消さないためのガード。
pub async fn release(
    client: &dyn LockClient,
    lease: &LockLease,
    mode: LockReleaseMode,
) -> Result<bool, LockError> {
    match mode {
        LockReleaseMode::Atomic => client.compare_and_delete(&lease.key, &lease.token).await,
        LockReleaseMode::CompareThenDelete => match client.get(&lease.key).await? {
            Some(current) if current == lease.token => client.delete(&lease.key).await,
            _ => Ok(false),
        },
    }
}
