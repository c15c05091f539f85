use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::client::LockClient;
use crate::LockError;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// プロセス内で完結するロッククライアント。単一プロセス構成とテスト用。
pub struct InMemoryLockClient {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryLockClient {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryLockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockClient for InMemoryLockClient {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        only_if_absent: bool,
    ) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        // 解放されずに期限切れになったロックはここで掃除する
        entries.retain(|_, e| !e.is_expired());
        if only_if_absent && entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(key).is_some_and(|e| !e.is_expired()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        // 同一 Mutex 内で比較と削除を行うためアトミック
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if !entry.is_expired() && entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_and_get() {
        let client = InMemoryLockClient::new();
        assert!(client
            .set("k", "token-1", Duration::from_secs(10), true)
            .await
            .unwrap());
        assert_eq!(client.get("k").await.unwrap().as_deref(), Some("token-1"));
    }

    #[tokio::test]
    async fn test_second_set_if_absent_is_rejected() {
        let client = InMemoryLockClient::new();
        client
            .set("k", "token-1", Duration::from_secs(10), true)
            .await
            .unwrap();
        let acquired = client
            .set("k", "token-2", Duration::from_secs(10), true)
            .await
            .unwrap();
        assert!(!acquired);
        assert_eq!(client.get("k").await.unwrap().as_deref(), Some("token-1"));
    }

    #[tokio::test]
    async fn test_plain_set_overwrites() {
        let client = InMemoryLockClient::new();
        client
            .set("k", "token-1", Duration::from_secs(10), true)
            .await
            .unwrap();
        assert!(client
            .set("k", "token-2", Duration::from_secs(10), false)
            .await
            .unwrap());
        assert_eq!(client.get("k").await.unwrap().as_deref(), Some("token-2"));
    }

    #[tokio::test]
    async fn test_expired_entry_can_be_reacquired() {
        let client = InMemoryLockClient::new();
        client
            .set("k", "token-1", Duration::from_millis(1), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(client.get("k").await.unwrap().is_none());
        assert!(client
            .set("k", "token-2", Duration::from_secs(10), true)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_set_prunes_expired_entries() {
        let client = InMemoryLockClient::new();
        for key in ["import:lock:a", "import:lock:b"] {
            client
                .set(key, "t", Duration::from_millis(10), true)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        client
            .set("import:lock:c", "t", Duration::from_secs(30), true)
            .await
            .unwrap();
        let entries = client.entries.lock().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("import:lock:c"));
    }

    #[tokio::test]
    async fn test_compare_and_delete_requires_matching_value() {
        let client = InMemoryLockClient::new();
        client
            .set("k", "token-1", Duration::from_secs(10), true)
            .await
            .unwrap();
        assert!(!client.compare_and_delete("k", "other").await.unwrap());
        assert!(client.compare_and_delete("k", "token-1").await.unwrap());
        assert!(client.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_key_returns_false() {
        let client = InMemoryLockClient::new();
        assert!(!client.delete("missing").await.unwrap());
    }
}
