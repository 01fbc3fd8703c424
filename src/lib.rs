//! # Subscription Store
//!
//! A durable, versioned registry of client-side query subscriptions for a
//! synchronizing embedded database.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: Named or anonymous query registrations per object
//!   class
//! - **Subscription sets**: Atomic, versioned collections persisted as an
//!   append-only history
//! - **States**: Each version advances `Pending → Bootstrapping → Complete`
//!   (or `Error`), driven by the sync client
//! - **Supersession**: A version reaching `Complete` removes every earlier
//!   version; stale handles observe `Superseded`
//! - **Notifications**: One-shot listeners resolve when a version reaches a
//!   target state
//!
//! ## Example
//!
//! ```ignore
//! use subscription_store::{Database, SetState, SubscriptionStore};
//!
//! let db = Database::open("./subscriptions")?;
//! let store = SubscriptionStore::open(db, |version| {
//!     // Hand the new pending version to the sync client.
//!     println!("new pending version: {version}");
//! })?;
//!
//! let mut mutable = store.get_latest()?.make_mutable_copy()?;
//! mutable.insert_or_assign(Some("adult-dogs"), "Dog", "age > 3");
//! let committed = mutable.commit()?;
//!
//! let listener = committed.get_state_change_notification(SetState::Complete)?;
//! ```

pub mod db;
pub mod error;
mod ext_json;
pub mod notify;
pub mod set;
pub mod store;
pub mod types;

// Re-exports
pub use db::{Database, ReadTransaction, WriteTransaction};
pub use error::{Result, StoreError};
pub use notify::StateChangeListener;
pub use set::{MutableSubscriptionSet, SubscriptionSet};
pub use store::{OnNewPending, PendingSubscription, SubscriptionStore};
pub use types::{SetState, Subscription, SubscriptionId, Timestamp};
