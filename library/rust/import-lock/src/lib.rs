pub mod client;
pub mod error;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use client::{lock_key, release, try_acquire, LockClient, LockLease, LockReleaseMode};
pub use error::LockError;
pub use memory::InMemoryLockClient;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockClient;

#[cfg(feature = "mock")]
pub use client::MockLockClient;
