//! Behaviour every `Store` backend must share.

use std::sync::Arc;
use std::thread;

use creditline_core::{
    ledger_sum, EntrySource, EntryStatus, EntryType, GenerationJob, JobProgress, JobStatus,
    NewEntry, ProcessId, Transition, UserId,
};
#[cfg(feature = "rocksdb-backend")]
use creditline_store::RocksStore;
use creditline_store::{reversal_key, MemoryStore, Store, StoreError};
use tempfile::TempDir;

fn grant(user_id: UserId, amount: i64) -> NewEntry {
    NewEntry::credit(user_id, EntryType::Bonus, amount, EntrySource::Admin, "grant")
}

/// Retry a unit that lost a lock race.
fn with_retry<T>(mut f: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
    loop {
        match f() {
            Err(e) if e.is_transient() => thread::yield_now(),
            other => return other,
        }
    }
}

fn assert_ledger_consistent(store: &dyn Store, user_id: &UserId) {
    let mut entries = store.list_entries(user_id).unwrap();
    entries.reverse();
    let mut running = 0;
    for entry in &entries {
        assert_eq!(entry.balance_before, running, "chain broken at {}", entry.transaction_ref);
        assert_eq!(entry.balance_after, entry.balance_before + entry.amount);
        running = entry.balance_after;
    }
    let cached = store
        .get_balance(user_id)
        .unwrap()
        .map_or(0, |b| b.credits);
    assert_eq!(ledger_sum(&entries), cached);
    assert_eq!(running, cached);
}

fn append_and_list(store: &dyn Store) {
    let user_id = UserId::generate();
    store.append_entry(grant(user_id, 500)).unwrap();
    store
        .append_entry(NewEntry::deduction(user_id, 120, "job a"))
        .unwrap();
    let last = store
        .append_entry(NewEntry::deduction(user_id, 80, "job b"))
        .unwrap();

    assert_eq!(last.balance_before, 380);
    assert_eq!(last.balance_after, 300);

    let entries = store.list_entries(&user_id).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].description, "job b");
    assert_eq!(entries[2].description, "grant");
    assert_ledger_consistent(store, &user_id);
}

fn idempotency_key_is_claimed_once(store: &dyn Store) {
    let user_id = UserId::generate();
    let first = store
        .append_entry(grant(user_id, 10_000).with_idempotency_key(Some("txn_1".into())))
        .unwrap();

    let err = store
        .append_entry(grant(user_id, 10_000).with_idempotency_key(Some("txn_1".into())))
        .unwrap_err();
    match err {
        StoreError::DuplicateIdempotencyKey {
            key,
            transaction_ref,
        } => {
            assert_eq!(key, "txn_1");
            assert_eq!(transaction_ref, first.transaction_ref);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(store.get_balance(&user_id).unwrap().unwrap().credits, 10_000);
    assert_eq!(
        store.find_by_idempotency_key("txn_1").unwrap().unwrap(),
        first
    );
}

fn refund_slot_is_claimed_once(store: &dyn Store) {
    let user_id = UserId::generate();
    store.append_entry(grant(user_id, 500)).unwrap();
    let debit = store
        .append_entry(NewEntry::deduction(user_id, 500, "job"))
        .unwrap();
    let related = debit.transaction_ref.to_string();

    let refund = NewEntry::refund(user_id, 500, related.clone(), EntrySource::System, "refund");
    let first = store.append_entry(refund.clone()).unwrap();
    assert!(matches!(
        store.append_entry(refund),
        Err(StoreError::DuplicateRefund { transaction_ref, .. }) if transaction_ref == first.transaction_ref
    ));

    assert_eq!(store.find_refund(&related).unwrap().unwrap(), first);
    assert_eq!(store.get_balance(&user_id).unwrap().unwrap().credits, 500);
    assert_ledger_consistent(store, &user_id);
}

fn overdraft_writes_nothing(store: &dyn Store) {
    let user_id = UserId::generate();
    store.append_entry(grant(user_id, 50)).unwrap();

    assert!(matches!(
        store.append_entry(NewEntry::deduction(user_id, 51, "too much")),
        Err(StoreError::InsufficientBalance {
            balance: 50,
            required: 51
        })
    ));
    assert_eq!(store.list_entries(&user_id).unwrap().len(), 1);
    assert_eq!(store.get_balance(&user_id).unwrap().unwrap().credits, 50);
}

fn reversal_rolls_back_once(store: &dyn Store) {
    let user_id = UserId::generate();
    let bonus = store.append_entry(grant(user_id, 300)).unwrap();

    let rollback = store
        .reverse_entry(&bonus.transaction_ref, "clawback", EntrySource::Admin)
        .unwrap();
    assert_eq!(rollback.amount, -300);
    assert_eq!(rollback.entry_type, EntryType::Rollback);
    assert_eq!(
        store.get_entry(&bonus.transaction_ref).unwrap().unwrap().status,
        EntryStatus::Reversed
    );

    assert!(matches!(
        store.reverse_entry(&bonus.transaction_ref, "again", EntrySource::Admin),
        Err(StoreError::DuplicateIdempotencyKey { key, .. }) if key == reversal_key(&bonus.transaction_ref)
    ));
    assert!(matches!(
        store.reverse_entry(&rollback.transaction_ref, "undo", EntrySource::Admin),
        Err(StoreError::InvalidState(_))
    ));

    assert_eq!(store.get_balance(&user_id).unwrap().unwrap().credits, 0);
    assert_ledger_consistent(store, &user_id);
}

fn reversing_spent_credit_is_rejected(store: &dyn Store) {
    let user_id = UserId::generate();
    let bonus = store.append_entry(grant(user_id, 100)).unwrap();
    store
        .append_entry(NewEntry::deduction(user_id, 60, "job"))
        .unwrap();

    assert!(matches!(
        store.reverse_entry(&bonus.transaction_ref, "clawback", EntrySource::Admin),
        Err(StoreError::InsufficientBalance { .. })
    ));
    assert_eq!(
        store.get_entry(&bonus.transaction_ref).unwrap().unwrap().status,
        EntryStatus::Completed
    );
}

fn rollbacks_cannot_be_appended_directly(store: &dyn Store) {
    let user_id = UserId::generate();
    let entry = NewEntry::credit(user_id, EntryType::Rollback, 5, EntrySource::Admin, "x");
    assert!(matches!(
        store.append_entry(entry),
        Err(StoreError::InvalidState(_))
    ));
}

fn profile_updates_leave_credits_alone(store: &dyn Store) {
    let user_id = UserId::generate();
    store.append_entry(grant(user_id, 42)).unwrap();

    store.set_customer_id(&user_id, "ctm_1").unwrap();
    store.set_subscription(&user_id, None).unwrap();
    store.mark_verified(&user_id, chrono::Utc::now()).unwrap();

    let balance = store.get_balance(&user_id).unwrap().unwrap();
    assert_eq!(balance.credits, 42);
    assert_eq!(balance.customer_id.as_deref(), Some("ctm_1"));
    assert!(balance.balance_verified_at.is_some());
    assert_eq!(store.find_user_by_customer("ctm_1").unwrap(), Some(user_id));
}

fn job_lifecycle(store: &dyn Store) {
    let process_id: ProcessId = "gen_contract".parse().unwrap();
    let job = GenerationJob::new(process_id.clone(), UserId::generate(), 20, 2, None);
    store.create_job(&job).unwrap();
    assert!(matches!(
        store.create_job(&job),
        Err(StoreError::DuplicateJob { .. })
    ));

    let update = store
        .update_job(
            &process_id,
            &JobProgress {
                failed_count: 2,
                ..JobProgress::default()
            },
        )
        .unwrap();
    assert_eq!(update.transition, Transition::Failed);
    assert_eq!(update.job.status, JobStatus::Failed);

    let refund_ref = creditline_core::TransactionRef::generate();
    let job = store.attach_refund(&process_id, refund_ref).unwrap();
    assert_eq!(job.refund_transaction_ref, Some(refund_ref));

    let missing: ProcessId = "gen_missing".parse().unwrap();
    assert!(matches!(
        store.update_job(&missing, &JobProgress::default()),
        Err(StoreError::NotFound { .. })
    ));
}

fn concurrent_deductions_never_overdraw(store: Arc<dyn Store>) {
    let user_id = UserId::generate();
    store.append_entry(grant(user_id, 500)).unwrap();

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                with_retry(|| store.append_entry(NewEntry::deduction(user_id, 100, format!("job {i}"))))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let insufficient = results
        .iter()
        .filter(|r| matches!(r, Err(StoreError::InsufficientBalance { .. })))
        .count();

    assert_eq!(ok, 5);
    assert_eq!(insufficient, 7);
    assert_eq!(store.get_balance(&user_id).unwrap().unwrap().credits, 0);
    assert_ledger_consistent(store.as_ref(), &user_id);
}

fn concurrent_progress_events_are_not_lost(store: Arc<dyn Store>) {
    let process_id: ProcessId = "gen_parallel".parse().unwrap();
    store
        .create_job(&GenerationJob::new(
            process_id.clone(),
            UserId::generate(),
            0,
            16,
            None,
        ))
        .unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let store = Arc::clone(&store);
            let process_id = process_id.clone();
            thread::spawn(move || {
                let progress = JobProgress {
                    completed_outputs: vec![serde_json::json!({ "output": i })],
                    ..JobProgress::default()
                };
                with_retry(|| store.update_job(&process_id, &progress)).unwrap()
            })
        })
        .collect();

    let completions = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|u| u.transition == Transition::Completed)
        .count();

    let job = store.get_job(&process_id).unwrap().unwrap();
    assert_eq!(completions, 1);
    assert_eq!(job.completed_output_count, 16);
    assert_eq!(job.result_payload.len(), 16);
    assert_eq!(job.status, JobStatus::Completed);
}

macro_rules! backend_tests {
    ($module:ident, $make:expr) => {
        mod $module {
            use super::*;

            #[allow(clippy::redundant_closure_call)]
            fn store() -> (Arc<dyn Store>, Option<TempDir>) {
                ($make)()
            }

            #[test]
            fn append_and_list() {
                let (store, _dir) = store();
                super::append_and_list(store.as_ref());
            }

            #[test]
            fn idempotency_key_is_claimed_once() {
                let (store, _dir) = store();
                super::idempotency_key_is_claimed_once(store.as_ref());
            }

            #[test]
            fn refund_slot_is_claimed_once() {
                let (store, _dir) = store();
                super::refund_slot_is_claimed_once(store.as_ref());
            }

            #[test]
            fn overdraft_writes_nothing() {
                let (store, _dir) = store();
                super::overdraft_writes_nothing(store.as_ref());
            }

            #[test]
            fn reversal_rolls_back_once() {
                let (store, _dir) = store();
                super::reversal_rolls_back_once(store.as_ref());
            }

            #[test]
            fn reversing_spent_credit_is_rejected() {
                let (store, _dir) = store();
                super::reversing_spent_credit_is_rejected(store.as_ref());
            }

            #[test]
            fn rollbacks_cannot_be_appended_directly() {
                let (store, _dir) = store();
                super::rollbacks_cannot_be_appended_directly(store.as_ref());
            }

            #[test]
            fn profile_updates_leave_credits_alone() {
                let (store, _dir) = store();
                super::profile_updates_leave_credits_alone(store.as_ref());
            }

            #[test]
            fn job_lifecycle() {
                let (store, _dir) = store();
                super::job_lifecycle(store.as_ref());
            }

            #[test]
            fn concurrent_deductions_never_overdraw() {
                let (store, _dir) = store();
                super::concurrent_deductions_never_overdraw(store);
            }

            #[test]
            fn concurrent_progress_events_are_not_lost() {
                let (store, _dir) = store();
                super::concurrent_progress_events_are_not_lost(store);
            }
        }
    };
}

backend_tests!(memory, || -> (Arc<dyn Store>, Option<TempDir>) {
    (Arc::new(MemoryStore::new()), None)
});

#[cfg(feature = "rocksdb-backend")]
backend_tests!(rocks, || -> (Arc<dyn Store>, Option<TempDir>) {
    let dir = TempDir::new().unwrap();
    let store = RocksStore::open(dir.path()).unwrap();
    (Arc::new(store), Some(dir))
});
