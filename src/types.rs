//! Core types for the subscription store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// On-disk state codes. Fixed for format compatibility.
pub const STATE_UNCOMMITTED: i64 = 0;
pub const STATE_ERROR: i64 = 1;
pub const STATE_PENDING: i64 = 2;
pub const STATE_BOOTSTRAPPING: i64 = 3;
pub const STATE_COMPLETE: i64 = 4;
pub const STATE_SUPERSEDED: i64 = 5;

/// Unique identifier for a subscription (128 bits).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub [u8; 16]);

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

impl SubscriptionId {
    /// Generate a fresh identifier from the clock, the process id, and a
    /// process-wide counter.
    pub fn generate() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(Timestamp::now().0.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(ID_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        let digest = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        SubscriptionId(id)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Lifecycle state of a subscription set.
///
/// `Error` carries the message reported by the server. Only the on-disk
/// encoding uses the integer codes; see [`SetState::code`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetState {
    /// Exists only on a mutable set before `commit()`. Never persisted.
    Uncommitted,
    /// The server rejected the set. Terminal.
    Error(String),
    /// Committed locally, awaiting upload.
    Pending,
    /// The server is streaming initial data for the set.
    Bootstrapping,
    /// The server acknowledged the set and all data has arrived. Terminal.
    Complete,
    /// A later version reached `Complete`. Synthetic, never persisted.
    Superseded,
}

impl SetState {
    /// The on-disk integer code for this state.
    pub fn code(&self) -> i64 {
        match self {
            SetState::Uncommitted => STATE_UNCOMMITTED,
            SetState::Error(_) => STATE_ERROR,
            SetState::Pending => STATE_PENDING,
            SetState::Bootstrapping => STATE_BOOTSTRAPPING,
            SetState::Complete => STATE_COMPLETE,
            SetState::Superseded => STATE_SUPERSEDED,
        }
    }

    /// Decode a persisted state code and error column.
    pub(crate) fn decode(code: i64, error: Option<String>) -> Result<Self> {
        match code {
            STATE_UNCOMMITTED => Ok(SetState::Uncommitted),
            STATE_ERROR => Ok(SetState::Error(error.unwrap_or_default())),
            STATE_PENDING => Ok(SetState::Pending),
            STATE_BOOTSTRAPPING => Ok(SetState::Bootstrapping),
            STATE_COMPLETE => Ok(SetState::Complete),
            STATE_SUPERSEDED => Ok(SetState::Superseded),
            other => Err(StoreError::InvalidFormat(format!(
                "unknown subscription set state code: {}",
                other
            ))),
        }
    }

    /// The error message, if this is the `Error` state.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            SetState::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Whether the state can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SetState::Complete | SetState::Error(_) | SetState::Superseded
        )
    }

    /// Short name for messages.
    pub fn name(&self) -> &'static str {
        match self {
            SetState::Uncommitted => "Uncommitted",
            SetState::Error(_) => "Error",
            SetState::Pending => "Pending",
            SetState::Bootstrapping => "Bootstrapping",
            SetState::Complete => "Complete",
            SetState::Superseded => "Superseded",
        }
    }

    /// Linear rank used by notification matching. `Pending` and
    /// `Bootstrapping` share a rank; `Complete` is above both.
    fn rank(&self) -> u8 {
        match self {
            SetState::Uncommitted => 0,
            SetState::Pending | SetState::Bootstrapping => 1,
            SetState::Complete => 2,
            SetState::Error(_) | SetState::Superseded => 3,
        }
    }

    /// Whether a set observed in this state satisfies a notification
    /// registered for `notify_when`. `Error` is terminal and matches any
    /// target.
    pub(crate) fn reached(&self, notify_when: &SetState) -> bool {
        matches!(self, SetState::Error(_)) || self.rank() >= notify_when.rank()
    }
}

impl fmt::Display for SetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One declared client-side query.
///
/// Immutable once committed. Two subscriptions are "the same" if they share a
/// name, or, for anonymous subscriptions, the `(object_class_name,
/// query_string)` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) created_at: Timestamp,
    pub(crate) updated_at: Timestamp,
    pub(crate) name: Option<String>,
    pub(crate) object_class_name: String,
    pub(crate) query_string: String,
}

impl Subscription {
    /// Create a new subscription with a fresh id and current timestamps.
    pub fn new(name: Option<&str>, object_class_name: &str, query_string: &str) -> Self {
        let now = Timestamp::now();
        Self {
            id: SubscriptionId::generate(),
            created_at: now,
            updated_at: now,
            name: name.map(str::to_owned),
            object_class_name: object_class_name.to_owned(),
            query_string: query_string.to_owned(),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    /// The subscription's name, or `None` for anonymous subscriptions.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn object_class_name(&self) -> &str {
        &self.object_class_name
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }
}

/// Persisted form of a subscription, embedded in its owning set row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub name: Option<String>,
    pub object_class: String,
    pub query: String,
}

impl From<&Subscription> for SubscriptionRecord {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id,
            created_at: sub.created_at,
            updated_at: sub.updated_at,
            name: sub.name.clone(),
            object_class: sub.object_class_name.clone(),
            query: sub.query_string.clone(),
        }
    }
}

impl From<&SubscriptionRecord> for Subscription {
    fn from(rec: &SubscriptionRecord) -> Self {
        Self {
            id: rec.id,
            created_at: rec.created_at,
            updated_at: rec.updated_at,
            name: rec.name.clone(),
            object_class_name: rec.object_class.clone(),
            query_string: rec.query.clone(),
        }
    }
}

/// Persisted form of a subscription set. The version number is the primary
/// key and lives outside the row, in the table map.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetRecord {
    pub state: i64,
    pub snapshot_version: u64,
    pub error: Option<String>,
    pub subscriptions: Vec<SubscriptionRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation_unique() {
        let a = SubscriptionId::generate();
        let b = SubscriptionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_hex().len(), 32);
    }

    #[test]
    fn test_state_codes_roundtrip() {
        for (state, code) in [
            (SetState::Uncommitted, 0),
            (SetState::Error("boom".into()), 1),
            (SetState::Pending, 2),
            (SetState::Bootstrapping, 3),
            (SetState::Complete, 4),
            (SetState::Superseded, 5),
        ] {
            assert_eq!(state.code(), code);
            let error = state.error_message().map(str::to_owned);
            assert_eq!(SetState::decode(code, error).unwrap(), state);
        }
        assert!(SetState::decode(42, None).is_err());
    }

    #[test]
    fn test_state_reached_ranks() {
        // Pending and Bootstrapping share a rank.
        assert!(SetState::Pending.reached(&SetState::Bootstrapping));
        assert!(SetState::Bootstrapping.reached(&SetState::Pending));
        assert!(!SetState::Pending.reached(&SetState::Complete));
        assert!(SetState::Complete.reached(&SetState::Pending));
        assert!(!SetState::Uncommitted.reached(&SetState::Pending));
        // Error matches any target.
        assert!(SetState::Error("x".into()).reached(&SetState::Complete));
    }

    #[test]
    fn test_subscription_record_roundtrip() {
        let sub = Subscription::new(Some("by-age"), "Dog", "age > 3");
        let rec = SubscriptionRecord::from(&sub);
        assert_eq!(Subscription::from(&rec), sub);
    }

    #[test]
    fn test_anonymous_subscription_has_no_name() {
        let sub = Subscription::new(None, "Cat", "TRUEPREDICATE");
        assert_eq!(sub.name(), None);
        assert_eq!(sub.created_at(), sub.updated_at());
    }
}
