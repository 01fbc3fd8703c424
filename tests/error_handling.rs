//! Error handling and edge case tests.

use std::sync::Arc;
use subscription_store::{Database, SetState, StoreError, SubscriptionStore};
use tempfile::TempDir;

fn test_store(dir: &TempDir) -> Arc<SubscriptionStore> {
    let db = Database::open(dir.path().join("db")).unwrap();
    SubscriptionStore::open(db, |_| {}).unwrap()
}

// --- Open Errors ---

#[test]
fn test_open_rejects_schema_version_mismatch() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");

    {
        let db = Database::open(&path).unwrap();
        let mut tx = db.begin_write();
        tx.set_schema_version("flx_subscription_store", 1);
        tx.commit().unwrap();
    }

    let db = Database::open(&path).unwrap();
    let result = SubscriptionStore::open(db, |_| {});
    assert!(matches!(
        result,
        Err(StoreError::SchemaVersionMismatch {
            expected: 2,
            found: 1
        })
    ));
}

#[test]
fn test_second_database_handle_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");

    let _store = {
        let db = Database::open(&path).unwrap();
        SubscriptionStore::open(db, |_| {}).unwrap()
    };

    assert!(matches!(Database::open(&path), Err(StoreError::Locked)));
}

// --- Lookup Errors ---

#[test]
fn test_get_by_version_unknown_fails() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = store.get_by_version(42);
    assert!(matches!(result, Err(StoreError::VersionNotFound(42))));
}

#[test]
fn test_get_mutable_by_version_unknown_fails() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = store.get_mutable_by_version(42);
    assert!(matches!(result, Err(StoreError::VersionNotFound(42))));
}

// --- Illegal State Transitions ---

#[test]
fn test_update_state_rejects_reserved_targets() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    for target in [
        SetState::Uncommitted,
        SetState::Pending,
        SetState::Superseded,
    ] {
        let result = mutable.update_state(target);
        assert!(matches!(
            result,
            Err(StoreError::IllegalStateTransition(_))
        ));
    }
}

#[test]
fn test_update_state_rejects_empty_error_message() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    let result = mutable.update_state(SetState::Error(String::new()));
    assert!(matches!(
        result,
        Err(StoreError::IllegalStateTransition(_))
    ));
}

#[test]
fn test_update_state_rejects_leaving_terminal_states() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    // Complete is terminal, even within one mutable handle.
    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable.update_state(SetState::Complete).unwrap();
    let result = mutable.update_state(SetState::Bootstrapping);
    assert!(matches!(
        result,
        Err(StoreError::IllegalStateTransition(_))
    ));
    drop(mutable);

    // Error is terminal across commits.
    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable.update_state(SetState::Error("boom".into())).unwrap();
    mutable.commit().unwrap();

    let mut failed = store.get_mutable_by_version(1).unwrap();
    let result = failed.update_state(SetState::Complete);
    assert!(matches!(
        result,
        Err(StoreError::IllegalStateTransition(_))
    ));
}

#[test]
fn test_update_state_allows_bootstrapping_to_bootstrapping() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable.update_state(SetState::Bootstrapping).unwrap();
    mutable.update_state(SetState::Bootstrapping).unwrap();
    let committed = mutable.commit().unwrap();
    assert_eq!(committed.state(), &SetState::Bootstrapping);
}

#[test]
fn test_error_message_present_iff_error_state() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable.insert_or_assign(None, "Dog", "age > 3");
    let pending = mutable.commit().unwrap();
    assert_eq!(pending.error_message(), None);

    let mut failing = store.get_mutable_by_version(1).unwrap();
    failing
        .update_state(SetState::Error("sync rejected".into()))
        .unwrap();
    let failed = failing.commit().unwrap();
    assert_eq!(failed.state(), &SetState::Error("sync rejected".into()));
    assert_eq!(failed.error_message(), Some("sync rejected"));

    // The message survives a reload from disk.
    let reread = store.get_by_version(1).unwrap();
    assert_eq!(reread.error_message(), Some("sync rejected"));
}

// --- Commit Promotion ---

#[test]
fn test_commit_promotes_uncommitted_to_pending() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    assert_eq!(mutable.state(), &SetState::Uncommitted);
    mutable.insert_or_assign(None, "Dog", "age > 3");
    let committed = mutable.commit().unwrap();
    assert_eq!(committed.state(), &SetState::Pending);
}

#[test]
fn test_new_version_can_commit_directly_complete() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable.insert_or_assign(None, "Dog", "age > 3");
    mutable.update_state(SetState::Complete).unwrap();
    let committed = mutable.commit().unwrap();

    assert_eq!(committed.state(), &SetState::Complete);
    assert_eq!(store.get_active().unwrap().version(), 1);
    // Earlier versions were superseded in the same commit.
    assert_eq!(store.get_by_version(0).unwrap().state(), &SetState::Superseded);
}

// --- Snapshot Monotonicity ---

#[test]
fn test_latest_versions_are_monotonic() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
        mutable.insert_or_assign(None, "Dog", "age > 3");
        mutable.commit().unwrap();
        seen.push(store.get_latest().unwrap().version());
    }
    assert_eq!(seen, vec![1, 2, 3]);

    let snapshot = store.get_latest().unwrap().snapshot_version();
    assert!(!store.would_refresh(store.begin_read().snapshot_version()));
    assert!(store.would_refresh(snapshot - 1));
}
