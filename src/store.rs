//! The subscription store: persisted schema, version allocation, lookups,
//! supersession, and the notification registry.

use crate::db::{Database, ReadTransaction};
use crate::error::{Result, StoreError};
use crate::notify::Registry;
use crate::set::{MutableSubscriptionSet, SubscriptionSet};
use crate::types::{STATE_BOOTSTRAPPING, STATE_COMPLETE, STATE_PENDING, SetRecord, SetState};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

// Schema version history:
//   v2: Initial public beta.
const SCHEMA_VERSION: i64 = 2;

/// Group key under which the store's schema version is recorded.
const SCHEMA_GROUP: &str = "flx_subscription_store";

/// Callback invoked from the committing thread after a new `Pending` version
/// is durable. Must not reenter the store on the same thread.
pub type OnNewPending = Box<dyn Fn(i64) + Send + Sync>;

/// A pending version and the database snapshot it was committed at, as
/// reported by [`SubscriptionStore::get_next_pending_version`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingSubscription {
    pub query_version: i64,
    pub snapshot_version: u64,
}

/// Durable, versioned registry of client-side query subscriptions.
///
/// Subscription sets are append-only: edits go through
/// [`make_mutable_copy`], which allocates the next version. Later versions
/// supersede earlier ones once they reach `Complete`.
///
/// [`make_mutable_copy`]: SubscriptionStore::make_mutable_copy
pub struct SubscriptionStore {
    db: Database,
    on_new_pending: OnNewPending,
    notifications: Registry,
}

impl SubscriptionStore {
    /// Open the store over `db`, initializing or validating the persisted
    /// schema and seeding version 0 (empty, `Pending`) on first open.
    ///
    /// Fails with [`StoreError::SchemaVersionMismatch`] if the database was
    /// written by an incompatible store version.
    pub fn open(
        db: Database,
        on_new_pending: impl Fn(i64) + Send + Sync + 'static,
    ) -> Result<Arc<Self>> {
        let tr = db.begin_read();
        match tr.schema_version(SCHEMA_GROUP) {
            Some(found) if found != SCHEMA_VERSION => {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    found,
                });
            }
            Some(_) => {}
            None => {
                let mut wtx = db.begin_write();
                wtx.set_schema_version(SCHEMA_GROUP, SCHEMA_VERSION);
                wtx.commit()?;
            }
        }
        drop(tr);

        // There must always be at least one subscription set so the caller
        // can always wait for synchronization on the result of get_latest().
        if db.begin_read().sub_sets().is_empty() {
            let mut wtx = db.begin_write();
            let snapshot_version = wtx.version();
            wtx.sub_sets_mut().insert(
                0,
                SetRecord {
                    state: STATE_PENDING,
                    snapshot_version,
                    error: None,
                    subscriptions: Vec::new(),
                },
            );
            wtx.commit()?;
            debug!("seeded subscription set version 0");
        }

        Ok(Arc::new(Self {
            db,
            on_new_pending: Box::new(on_new_pending),
            notifications: Registry::default(),
        }))
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.notifications
    }

    pub(crate) fn notify_new_pending(&self, version: i64) {
        (self.on_new_pending)(version);
    }

    /// The set at the highest version.
    pub fn get_latest(self: &Arc<Self>) -> Result<SubscriptionSet> {
        let tr = self.db.begin_read();
        match tr.sub_sets().last_key_value() {
            Some((&version, record)) => SubscriptionSet::from_record(
                Arc::downgrade(self),
                tr.snapshot_version(),
                version,
                record,
            ),
            None => Ok(SubscriptionSet::sentinel(
                Arc::downgrade(self),
                tr.snapshot_version(),
            )),
        }
    }

    /// The set at the highest version whose state is `Complete`, or an empty
    /// sentinel when none is.
    pub fn get_active(self: &Arc<Self>) -> Result<SubscriptionSet> {
        let tr = self.db.begin_read();
        match tr
            .sub_sets()
            .iter()
            .rev()
            .find(|(_, record)| record.state == STATE_COMPLETE)
        {
            Some((&version, record)) => SubscriptionSet::from_record(
                Arc::downgrade(self),
                tr.snapshot_version(),
                version,
                record,
            ),
            None => Ok(SubscriptionSet::sentinel(
                Arc::downgrade(self),
                tr.snapshot_version(),
            )),
        }
    }

    /// `(active_version, latest_version)`; the active version is `-1` when
    /// no set is `Complete`.
    pub fn get_active_and_latest_versions(&self) -> (i64, i64) {
        let tr = self.db.begin_read();
        let Some((&latest, _)) = tr.sub_sets().last_key_value() else {
            return (0, 0);
        };
        let active = tr
            .sub_sets()
            .iter()
            .rev()
            .find(|(_, record)| record.state == STATE_COMPLETE)
            .map(|(&version, _)| version)
            .unwrap_or(-1);
        (active, latest)
    }

    /// The set at exactly `version`.
    ///
    /// A version below the supersession watermark yields a synthetic set in
    /// state `Superseded`; an unknown version above it fails with
    /// [`StoreError::VersionNotFound`].
    pub fn get_by_version(self: &Arc<Self>, version: i64) -> Result<SubscriptionSet> {
        let tr = self.db.begin_read();
        match tr.sub_sets().get(&version) {
            Some(record) => SubscriptionSet::from_record(
                Arc::downgrade(self),
                tr.snapshot_version(),
                version,
                record,
            ),
            None => {
                if version < self.notifications.min_outstanding_version() {
                    Ok(SubscriptionSet::superseded(Arc::downgrade(self), version))
                } else {
                    Err(StoreError::VersionNotFound(version))
                }
            }
        }
    }

    /// A write handle over an existing version, for state updates by the
    /// sync client. Blocks while another write transaction is live.
    pub fn get_mutable_by_version(
        self: &Arc<Self>,
        version: i64,
    ) -> Result<MutableSubscriptionSet> {
        let tx = self.db.begin_write();
        let record = tx
            .sub_sets()
            .get(&version)
            .ok_or(StoreError::VersionNotFound(version))?
            .clone();
        MutableSubscriptionSet::existing_version(Arc::downgrade(self), tx, version, &record)
    }

    /// Start a new version at `latest + 1`, pre-populated with `set`'s
    /// subscriptions in order. Blocks while another write transaction is
    /// live. The version number is not reserved until commit; an abandoned
    /// copy rolls back and the number is reused.
    pub fn make_mutable_copy(
        self: &Arc<Self>,
        set: &SubscriptionSet,
    ) -> Result<MutableSubscriptionSet> {
        let tx = self.db.begin_write();
        let new_version = tx
            .sub_sets()
            .last_key_value()
            .map(|(&version, _)| version)
            .unwrap_or(-1)
            + 1;
        Ok(MutableSubscriptionSet::new_version(
            Arc::downgrade(self),
            tx,
            new_version,
            set.iter().cloned().collect(),
        ))
    }

    /// The smallest version above `last_query_version` that is `Pending` or
    /// `Bootstrapping` and was committed at or after `after_client_version`.
    pub fn get_next_pending_version(
        &self,
        last_query_version: i64,
        after_client_version: u64,
    ) -> Option<PendingSubscription> {
        let tr = self.db.begin_read();
        tr.sub_sets()
            .range(last_query_version + 1..)
            .find(|(_, record)| {
                (record.state == STATE_PENDING || record.state == STATE_BOOTSTRAPPING)
                    && record.snapshot_version >= after_client_version
            })
            .map(|(&version, record)| PendingSubscription {
                query_version: version,
                snapshot_version: record.snapshot_version,
            })
    }

    /// All versions still awaiting upload, in order, starting after the
    /// active version. Used by the sync client on reconnect to replay
    /// in-flight sets.
    pub fn get_pending_subscriptions(self: &Arc<Self>) -> Result<Vec<SubscriptionSet>> {
        let mut pending = Vec::new();
        let active = self.get_active()?;
        let mut query_version = active.version();
        let mut client_version = if *active.state() == SetState::Complete {
            active.snapshot_version()
        } else {
            0
        };
        while let Some(next) = self.get_next_pending_version(query_version, client_version) {
            query_version = next.query_version;
            client_version = next.snapshot_version;
            pending.push(self.get_by_version(query_version)?);
        }
        Ok(pending)
    }

    /// Object class names referenced by the latest version's subscriptions,
    /// read from the caller's transaction.
    pub fn get_tables_for_latest(&self, tr: &ReadTransaction) -> BTreeSet<String> {
        tr.sub_sets()
            .last_key_value()
            .map(|(_, record)| {
                record
                    .subscriptions
                    .iter()
                    .map(|sub| sub.object_class.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Begin a frozen read transaction on the underlying database, for use
    /// with [`get_tables_for_latest`].
    ///
    /// [`get_tables_for_latest`]: SubscriptionStore::get_tables_for_latest
    pub fn begin_read(&self) -> ReadTransaction {
        self.db.begin_read()
    }

    /// Whether the underlying database has a snapshot newer than `version`.
    pub fn would_refresh(&self, version: u64) -> bool {
        version < self.db.latest_snapshot_version()
    }

    /// Drop every version prior to `set`'s from disk, resolve all pending
    /// notifications for other versions as `Superseded`, and advance the
    /// watermark to `set`'s version. Runs in `set`'s write transaction; the
    /// caller still commits it.
    pub fn supersede_all_except(&self, set: &mut MutableSubscriptionSet) -> Result<()> {
        let keep = set.version();
        let tx = set.tx_mut();
        tx.ensure_writing()?;
        tx.sub_sets_mut().retain(|&version, _| version >= keep);

        self.notifications.supersede_all_except(keep);
        debug!(keep, "superseded all subscription sets except one");
        Ok(())
    }
}

impl Drop for SubscriptionStore {
    fn drop(&mut self) {
        // Nothing can resolve these anymore; report supersession instead of
        // leaving listeners blocked.
        self.notifications.shutdown();
    }
}
