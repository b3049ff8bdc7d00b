//! Named distributed lock used to serialize registry reconciliation.
//!
//! Only one member at a time may rewrite the canonical address list, across
//! all processes sharing the registry. The lock is named, TTL'd (a crashed
//! holder must not wedge the cluster), and acquired with bounded retry.
//! Contention is an expected outcome, not a failure: the routine reconcile
//! path simply skips its attempt, only the startup path treats exhausted
//! retries as fatal.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::StoreError;
use crate::registry::current_time_ms;

/// Proof of one successful acquisition, required to release.
///
/// Tokens make release safe after a TTL steal: releasing with a stale token
/// leaves the current holder untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken(Uuid);

impl LockToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure modes of lock acquisition/release.
#[derive(Debug)]
pub enum LockError {
    /// All attempts found the lock held by someone else.
    Contended {
        /// The lock name.
        name: String,
        /// How many acquisition attempts were made.
        attempts: u32,
    },
    /// The lock backend itself failed.
    Backend(StoreError),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contended { name, attempts } => {
                write!(f, "lock '{name}' still contended after {attempts} attempts")
            }
            Self::Backend(err) => write!(f, "lock backend error: {err}"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Contended { .. } => None,
            Self::Backend(err) => Some(err.as_ref()),
        }
    }
}

/// Cross-process mutual exclusion with a TTL and bounded retry.
///
/// `attempts` is the total number of tries (minimum one); `retry_wait` is
/// slept between tries. The TTL bounds how long a crashed holder can block
/// others — implementations must let an expired lock be taken over.
pub trait DistributedLock: Send + Sync {
    /// Try to take the named lock.
    fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        retry_wait: Duration,
        attempts: u32,
    ) -> impl Future<Output = Result<LockToken, LockError>> + Send;

    /// Release a previously acquired lock.
    ///
    /// Releasing after the TTL already let someone else take over is benign
    /// and must not error.
    fn release(
        &self,
        name: &str,
        token: LockToken,
    ) -> impl Future<Output = Result<(), LockError>> + Send;
}

struct Held {
    token: LockToken,
    expires_at_ms: u64,
}

/// Single-process [`DistributedLock`] for tests and embedded use.
///
/// Honors the TTL: an expired entry is taken over by the next acquirer, the
/// way a store-backed lock would behave after its holder crashed.
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, Held>>,
}

impl MemoryLock {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the named lock is currently held (and not expired).
    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .get(name)
            .map(|held| held.expires_at_ms > current_time_ms())
            .unwrap_or(false)
    }

    fn try_acquire(&self, name: &str, ttl: Duration) -> Option<LockToken> {
        let now = current_time_ms();
        let mut held = self.held.lock();
        match held.get(name) {
            Some(existing) if existing.expires_at_ms > now => None,
            Some(_) => {
                debug!(name, "taking over expired lock");
                let token = LockToken::new();
                held.insert(
                    name.to_owned(),
                    Held {
                        token,
                        expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
                    },
                );
                Some(token)
            }
            None => {
                let token = LockToken::new();
                held.insert(
                    name.to_owned(),
                    Held {
                        token,
                        expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
                    },
                );
                Some(token)
            }
        }
    }
}

impl DistributedLock for MemoryLock {
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        retry_wait: Duration,
        attempts: u32,
    ) -> Result<LockToken, LockError> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(token) = self.try_acquire(name, ttl) {
                trace!(name, attempt, "lock acquired");
                return Ok(token);
            }
            if attempt < attempts {
                tokio::time::sleep(retry_wait).await;
            }
        }
        Err(LockError::Contended {
            name: name.to_owned(),
            attempts,
        })
    }

    async fn release(&self, name: &str, token: LockToken) -> Result<(), LockError> {
        let mut held = self.held.lock();
        match held.get(name) {
            Some(existing) if existing.token == token => {
                held.remove(name);
            }
            _ => debug!(name, "releasing a lock no longer held by this token"),
        }
        Ok(())
    }
}
