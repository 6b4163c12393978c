//! First-contact pairing: a `(channel, userID)` must complete a one-time
//! code handshake before its traffic is allowed through, when pairing is
//! required by config.
//!
//! Pending codes live in memory only (they're short-lived and per-process);
//! completed pairs are durable and delegated to whatever implements
//! [`PairingPersistence`] — `oxibot-store`'s `Store`, in the full gateway.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// How long an issued pairing code remains valid.
pub const CODE_TTL_MINUTES: i64 = 10;

/// Default TTL for a completed pair, when the config doesn't override it.
pub const DEFAULT_PAIR_TTL_DAYS: i64 = 30;

/// Durable half of pairing: whether a `(channel, userID)` has already
/// completed the handshake, and recording a newly completed one.
#[async_trait]
pub trait PairingPersistence: Send + Sync {
    async fn is_paired(&self, channel: &str, user_id: &str) -> bool;
    async fn persist_pair(&self, channel: &str, user_id: &str, ttl_days: Option<i64>);
}

/// An in-memory store that never considers anyone paired and discards
/// completed pairs — useful when pairing is disabled or in tests.
pub struct NullPairingPersistence;

#[async_trait]
impl PairingPersistence for NullPairingPersistence {
    async fn is_paired(&self, _channel: &str, _user_id: &str) -> bool {
        false
    }
    async fn persist_pair(&self, _channel: &str, _user_id: &str, _ttl_days: Option<i64>) {}
}

/// Result of requesting pairing for a `(channel, userID)`.
#[derive(Debug, PartialEq, Eq)]
pub enum PairingOutcome {
    /// Already paired; traffic should pass straight through.
    AlreadyPaired,
    /// A fresh or still-valid code was issued; show it to the user.
    CodeIssued(String),
}

struct PendingCode {
    code: String,
    expires_at: DateTime<Utc>,
}

/// Tracks pending pairing codes and defers completed-pair lookups to
/// [`PairingPersistence`].
pub struct PairingStore {
    pending: Mutex<HashMap<(String, String), PendingCode>>,
    persistence: std::sync::Arc<dyn PairingPersistence>,
    pair_ttl_days: i64,
}

impl PairingStore {
    pub fn new(persistence: std::sync::Arc<dyn PairingPersistence>, pair_ttl_days: i64) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            persistence,
            pair_ttl_days,
        }
    }

    /// Whether `(channel, userID)` may interact without further pairing.
    pub async fn is_paired(&self, channel: &str, user_id: &str) -> bool {
        self.persistence.is_paired(channel, user_id).await
    }

    /// Request (or re-request) pairing for `(channel, userID)`. Issues a new
    /// 6-digit code unless one is already pending and unexpired, in which
    /// case the same code is returned so repeated prompts don't invalidate
    /// an in-flight one.
    pub fn request_pairing(&self, channel: &str, user_id: &str) -> PairingOutcome {
        self.sweep_expired();

        let key = (channel.to_string(), user_id.to_string());
        let mut pending = self.pending.lock().unwrap();

        if let Some(existing) = pending.get(&key) {
            return PairingOutcome::CodeIssued(existing.code.clone());
        }

        let code = generate_code();
        pending.insert(
            key,
            PendingCode {
                code: code.clone(),
                expires_at: Utc::now() + Duration::minutes(CODE_TTL_MINUTES),
            },
        );
        PairingOutcome::CodeIssued(code)
    }

    /// Verify a submitted code. On success, persists the pair and clears the
    /// pending entry; on failure (wrong code or expired), leaves the pending
    /// entry untouched so the user can retry within the original window.
    pub async fn verify_code(&self, channel: &str, user_id: &str, submitted: &str) -> bool {
        self.sweep_expired();

        let key = (channel.to_string(), user_id.to_string());
        let matched = {
            let pending = self.pending.lock().unwrap();
            match pending.get(&key) {
                Some(entry) => entry.code == submitted.trim() && Utc::now() < entry.expires_at,
                None => false,
            }
        };

        if matched {
            self.pending.lock().unwrap().remove(&key);
            self.persistence
                .persist_pair(channel, user_id, Some(self.pair_ttl_days))
                .await;
        }
        matched
    }

    fn sweep_expired(&self) {
        let now = Utc::now();
        self.pending.lock().unwrap().retain(|_, v| v.expires_at > now);
    }
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    format!("{:06}", rng.gen_range(0..1_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    struct InMemoryPersistence {
        paired: StdMutex<Vec<(String, String)>>,
    }

    impl InMemoryPersistence {
        fn new() -> Self {
            Self { paired: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl PairingPersistence for InMemoryPersistence {
        async fn is_paired(&self, channel: &str, user_id: &str) -> bool {
            self.paired
                .lock()
                .unwrap()
                .iter()
                .any(|(c, u)| c == channel && u == user_id)
        }

        async fn persist_pair(&self, channel: &str, user_id: &str, _ttl_days: Option<i64>) {
            self.paired.lock().unwrap().push((channel.to_string(), user_id.to_string()));
        }
    }

    #[test]
    fn generated_code_is_six_digits() {
        let code = generate_code();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn unpaired_user_is_not_paired_initially() {
        let store = PairingStore::new(Arc::new(InMemoryPersistence::new()), DEFAULT_PAIR_TTL_DAYS);
        assert!(!store.is_paired("telegram", "u1").await);
    }

    #[tokio::test]
    async fn full_pairing_handshake() {
        let store = PairingStore::new(Arc::new(InMemoryPersistence::new()), DEFAULT_PAIR_TTL_DAYS);

        let code = match store.request_pairing("telegram", "u1") {
            PairingOutcome::CodeIssued(c) => c,
            other => panic!("expected CodeIssued, got {other:?}"),
        };

        assert!(!store.verify_code("telegram", "u1", "000000").await || code == "000000");
        assert!(store.verify_code("telegram", "u1", &code).await);
        assert!(store.is_paired("telegram", "u1").await);
    }

    #[tokio::test]
    async fn wrong_code_is_rejected_and_does_not_consume_pending() {
        let store = PairingStore::new(Arc::new(InMemoryPersistence::new()), DEFAULT_PAIR_TTL_DAYS);
        let code = match store.request_pairing("telegram", "u1") {
            PairingOutcome::CodeIssued(c) => c,
            other => panic!("expected CodeIssued, got {other:?}"),
        };

        let wrong = if code == "111111" { "222222" } else { "111111" };
        assert!(!store.verify_code("telegram", "u1", wrong).await);
        // Original code still valid after a wrong attempt.
        assert!(store.verify_code("telegram", "u1", &code).await);
    }

    #[test]
    fn repeated_pairing_request_returns_same_pending_code() {
        let store = PairingStore::new(Arc::new(InMemoryPersistence::new()), DEFAULT_PAIR_TTL_DAYS);
        let first = match store.request_pairing("telegram", "u1") {
            PairingOutcome::CodeIssued(c) => c,
            other => panic!("expected CodeIssued, got {other:?}"),
        };
        let second = match store.request_pairing("telegram", "u1") {
            PairingOutcome::CodeIssued(c) => c,
            other => panic!("expected CodeIssued, got {other:?}"),
        };
        assert_eq!(first, second);
    }
}
