use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("ロックサービスに接続できません: {0}")]
    Unavailable(String),
    #[error("内部エラー: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            LockError::Unavailable("connection refused".into()).to_string(),
            "ロックサービスに接続できません: connection refused"
        );
        assert_eq!(
            LockError::Internal("unexpected reply".into()).to_string(),
            "内部エラー: unexpected reply"
        );
    }
}
