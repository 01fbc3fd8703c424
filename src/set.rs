//! Frozen and mutable views of a subscription set.

use crate::db::WriteTransaction;
use crate::error::{Result, StoreError};
use crate::notify::{OutstandingGuard, StateChangeListener};
use crate::store::SubscriptionStore;
use crate::types::{SetRecord, SetState, Subscription, SubscriptionRecord, Timestamp};
use std::sync::{Arc, Weak};
use tracing::debug;

/// An immutable snapshot of one subscription set version.
///
/// Holds a weak reference to its store; operations that need the store fail
/// with [`StoreError::StoreGone`] once the store has been dropped.
#[derive(Clone)]
pub struct SubscriptionSet {
    store: Weak<SubscriptionStore>,
    /// Database snapshot version this view was loaded at.
    db_snapshot: u64,
    version: i64,
    state: SetState,
    snapshot_version: u64,
    subs: Vec<Subscription>,
}

impl SubscriptionSet {
    pub(crate) fn from_record(
        store: Weak<SubscriptionStore>,
        db_snapshot: u64,
        version: i64,
        record: &SetRecord,
    ) -> Result<Self> {
        Ok(Self {
            store,
            db_snapshot,
            version,
            state: SetState::decode(record.state, record.error.clone())?,
            snapshot_version: record.snapshot_version,
            subs: record.subscriptions.iter().map(Subscription::from).collect(),
        })
    }

    /// Synthetic placeholder for a version that fell below the supersession
    /// watermark. Never backed by a row.
    pub(crate) fn superseded(store: Weak<SubscriptionStore>, version: i64) -> Self {
        Self {
            store,
            db_snapshot: 0,
            version,
            state: SetState::Superseded,
            snapshot_version: 0,
            subs: Vec::new(),
        }
    }

    /// Empty sentinel, reported when no set matches a lookup (for example
    /// `get_active` with no `Complete` version).
    pub(crate) fn sentinel(store: Weak<SubscriptionStore>, db_snapshot: u64) -> Self {
        Self {
            store,
            db_snapshot,
            version: 0,
            state: SetState::Uncommitted,
            snapshot_version: 0,
            subs: Vec::new(),
        }
    }

    fn store(&self) -> Result<Arc<SubscriptionStore>> {
        self.store.upgrade().ok_or(StoreError::StoreGone)
    }

    /// The version of this set; the primary key on disk.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The state this set was in when the view was loaded.
    pub fn state(&self) -> &SetState {
        &self.state
    }

    /// The error message, if the set is in the `Error` state.
    pub fn error_message(&self) -> Option<&str> {
        self.state.error_message()
    }

    /// Database snapshot version at the moment this set was committed.
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Subscriptions in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Subscription> {
        self.subs.iter()
    }

    /// The subscription at `index` in insertion order, if any.
    pub fn get(&self, index: usize) -> Option<&Subscription> {
        self.subs.get(index)
    }

    /// Find a named subscription.
    pub fn find_by_name(&self, name: &str) -> Option<&Subscription> {
        self.subs.iter().find(|sub| sub.name() == Some(name))
    }

    /// Find a subscription by object class and query text.
    pub fn find_by_query(&self, object_class: &str, query: &str) -> Option<&Subscription> {
        self.subs
            .iter()
            .find(|sub| sub.object_class_name() == object_class && sub.query_string() == query)
    }

    /// Start a new mutable version seeded with this set's subscriptions.
    pub fn make_mutable_copy(&self) -> Result<MutableSubscriptionSet> {
        self.store()?.make_mutable_copy(self)
    }

    /// Reload this view if the database has advanced past the snapshot it
    /// was taken at. Idempotent when nothing has changed.
    pub fn refresh(&mut self) -> Result<()> {
        let store = self.store()?;
        if store.would_refresh(self.db_snapshot) {
            *self = store.get_by_version(self.version)?;
        }
        Ok(())
    }

    /// Register a one-shot notification that resolves when this set reaches
    /// `notify_when` or `Error`, or when it becomes superseded.
    pub fn get_state_change_notification(
        &self,
        notify_when: SetState,
    ) -> Result<StateChangeListener> {
        let store = self.store()?;
        let registry = store.registry();

        // The watermark check and the gate increment happen under one lock
        // acquisition, so a concurrent writer cannot resolve notifications
        // between them.
        if !registry.begin_request(self.version) {
            return Ok(StateChangeListener::ready(Ok(SetState::Superseded)));
        }
        let _guard = OutstandingGuard::new(registry);

        // If the database advanced since this view was loaded, the persisted
        // state is the truth.
        let cur_state = if self.db_snapshot < store.database().latest_snapshot_version() {
            store.get_by_version(self.version)?.state
        } else {
            self.state.clone()
        };

        match cur_state {
            SetState::Error(msg) => Ok(StateChangeListener::ready(Err(StoreError::Runtime(msg)))),
            state if state.reached(&notify_when) => Ok(StateChangeListener::ready(Ok(state))),
            _ => Ok(registry.enqueue(self.version, notify_when)),
        }
    }

    /// Canonical compact JSON for the sync server; see [`crate::ext_json`].
    pub fn to_ext_json(&self) -> String {
        crate::ext_json::to_ext_json(
            self.subs
                .iter()
                .map(|sub| (sub.object_class_name(), sub.query_string())),
        )
    }
}

impl<'a> IntoIterator for &'a SubscriptionSet {
    type Item = &'a Subscription;
    type IntoIter = std::slice::Iter<'a, Subscription>;

    fn into_iter(self) -> Self::IntoIter {
        self.subs.iter()
    }
}

/// A writable subscription set layered over a live write transaction.
///
/// Only one mutable set can exist at a time; creating a second one blocks
/// until the first commits or is dropped. Dropping without [`commit`]
/// rolls the transaction back and releases the version number for reuse.
///
/// [`commit`]: MutableSubscriptionSet::commit
pub struct MutableSubscriptionSet {
    store: Weak<SubscriptionStore>,
    tx: WriteTransaction,
    version: i64,
    old_state: SetState,
    state: SetState,
    snapshot_version: u64,
    subs: Vec<Subscription>,
}

impl MutableSubscriptionSet {
    /// A brand-new version, not yet backed by a row.
    pub(crate) fn new_version(
        store: Weak<SubscriptionStore>,
        tx: WriteTransaction,
        version: i64,
        subs: Vec<Subscription>,
    ) -> Self {
        Self {
            store,
            tx,
            version,
            old_state: SetState::Uncommitted,
            state: SetState::Uncommitted,
            snapshot_version: 0,
            subs,
        }
    }

    /// A write handle over an existing committed version, for state updates
    /// by the sync client.
    pub(crate) fn existing_version(
        store: Weak<SubscriptionStore>,
        tx: WriteTransaction,
        version: i64,
        record: &SetRecord,
    ) -> Result<Self> {
        let state = SetState::decode(record.state, record.error.clone())?;
        Ok(Self {
            store,
            tx,
            version,
            old_state: state.clone(),
            state,
            snapshot_version: record.snapshot_version,
            subs: record.subscriptions.iter().map(Subscription::from).collect(),
        })
    }

    fn store(&self) -> Result<Arc<SubscriptionStore>> {
        self.store.upgrade().ok_or(StoreError::StoreGone)
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn state(&self) -> &SetState {
        &self.state
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Subscription> {
        self.subs.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Subscription> {
        self.subs.iter().find(|sub| sub.name() == Some(name))
    }

    pub fn find_by_query(&self, object_class: &str, query: &str) -> Option<&Subscription> {
        self.subs
            .iter()
            .find(|sub| sub.object_class_name() == object_class && sub.query_string() == query)
    }

    /// Insert a subscription or update the matching one in place.
    ///
    /// With a name, the match is by name; anonymous subscriptions match by
    /// `(object_class, query)`. On a match the object class, query, and
    /// `updated_at` are overwritten. Returns the index of the subscription
    /// and whether it was newly inserted.
    pub fn insert_or_assign(
        &mut self,
        name: Option<&str>,
        object_class: &str,
        query: &str,
    ) -> (usize, bool) {
        let found = match name {
            Some(name) => self.subs.iter().position(|sub| sub.name() == Some(name)),
            None => self.subs.iter().position(|sub| {
                sub.name().is_none()
                    && sub.object_class_name() == object_class
                    && sub.query_string() == query
            }),
        };

        match found {
            Some(index) => {
                let sub = &mut self.subs[index];
                sub.object_class_name = object_class.to_owned();
                sub.query_string = query.to_owned();
                sub.updated_at = Timestamp::now();
                (index, false)
            }
            None => {
                self.subs.push(Subscription::new(name, object_class, query));
                (self.subs.len() - 1, true)
            }
        }
    }

    /// Append a pre-built subscription without matching.
    pub fn insert_sub(&mut self, sub: Subscription) {
        self.subs.push(sub);
    }

    /// Remove the subscription at `index`.
    pub fn erase(&mut self, index: usize) -> Subscription {
        self.subs.remove(index)
    }

    /// Remove all subscriptions.
    pub fn clear(&mut self) {
        self.subs.clear();
    }

    /// Replace this set's subscriptions with a copy of `other`'s, in order.
    pub fn import(&mut self, other: &SubscriptionSet) {
        self.clear();
        for sub in other {
            self.insert_sub(sub.clone());
        }
    }

    /// Stage a state change for the next [`commit`].
    ///
    /// Valid targets are `Bootstrapping`, `Complete`, and `Error` (which
    /// must carry a non-empty message), and only from `Uncommitted`,
    /// `Pending`, or `Bootstrapping`.
    ///
    /// [`commit`]: MutableSubscriptionSet::commit
    pub fn update_state(&mut self, new_state: SetState) -> Result<()> {
        self.tx.ensure_writing()?;

        match &new_state {
            SetState::Uncommitted | SetState::Pending | SetState::Superseded => {
                return Err(StoreError::IllegalStateTransition(format!(
                    "cannot set a subscription set to the {} state",
                    new_state.name()
                )));
            }
            SetState::Error(msg) if msg.is_empty() => {
                return Err(StoreError::IllegalStateTransition(
                    "an error message is required when setting the Error state".into(),
                ));
            }
            _ => {}
        }

        if self.state.is_terminal() {
            return Err(StoreError::IllegalStateTransition(format!(
                "subscription set in state {} cannot transition to {}",
                self.state.name(),
                new_state.name()
            )));
        }

        self.state = new_state;
        Ok(())
    }

    /// Commit the staged subscriptions and state.
    ///
    /// A new version that was never moved out of `Uncommitted` is promoted
    /// to `Pending`. Reaching `Complete` deletes every earlier version in
    /// the same write transaction. After the write is durable, matching
    /// notifications resolve and, for a new `Pending` version, the store's
    /// new-pending callback fires. Returns the committed frozen view.
    pub fn commit(mut self) -> Result<SubscriptionSet> {
        self.tx.ensure_writing()?;
        let store = self.store()?;

        let is_new = self.old_state == SetState::Uncommitted;
        if is_new {
            if self.state == SetState::Uncommitted {
                self.state = SetState::Pending;
            }
            self.snapshot_version = self.tx.version();
            self.tx.sub_sets_mut().insert(
                self.version,
                SetRecord {
                    state: self.state.code(),
                    snapshot_version: self.snapshot_version,
                    error: self.state.error_message().map(str::to_owned),
                    subscriptions: self.subs.iter().map(SubscriptionRecord::from).collect(),
                },
            );
        } else {
            let row = self
                .tx
                .sub_sets_mut()
                .get_mut(&self.version)
                .ok_or(StoreError::VersionNotFound(self.version))?;
            row.state = self.state.code();
            if let Some(msg) = self.state.error_message() {
                row.error = Some(msg.to_owned());
            }
        }

        if self.state == SetState::Complete {
            let keep_from = self.version;
            self.tx.sub_sets_mut().retain(|&version, _| version >= keep_from);
        }

        let version = self.version;
        let state = self.state.clone();
        let read_tx = self.tx.commit_and_continue_as_read()?;

        debug!(version, state = %state, "committed subscription set");

        store.registry().process_notifications(version, &state);

        if state == SetState::Pending {
            store.notify_new_pending(version);
        }

        let record = read_tx
            .sub_sets()
            .get(&version)
            .ok_or(StoreError::VersionNotFound(version))?;
        SubscriptionSet::from_record(
            self.store.clone(),
            read_tx.snapshot_version(),
            version,
            record,
        )
    }

    pub(crate) fn tx_mut(&mut self) -> &mut WriteTransaction {
        &mut self.tx
    }
}
