//! `RocksDB` storage implementation.
//!
//! Every mutation runs in a pessimistic `TransactionDB` transaction. Rows are
//! locked with `get_for_update` before they are read, so two writers touching
//! the same balance, idempotency key, refund slot or job serialize on the row
//! lock no matter which process they run in. Lock waits that time out surface
//! as [`StoreError::Transient`] and are retried by the caller.
//!
//! Lock order inside a unit is fixed: idempotency key, refund slot, original
//! entry (reversals only), balance, new ledger key, customer index.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, ErrorKind, IteratorMode, MultiThreaded, Options,
    Transaction, TransactionDB, TransactionDBOptions,
};
use tracing::debug;

use creditline_core::{
    ledger_sum, EntrySource, EntryStatus, EntryType, GenerationJob, JobProgress, LedgerEntry,
    NewEntry, ProcessId, SubscriptionSnapshot, TransactionRef, Transition, UserBalance, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::ops;
use crate::schema::{all_column_families, cf};
use crate::{BalanceRebuild, JobUpdate, Store};

type Db = TransactionDB<MultiThreaded>;
type Txn<'a> = Transaction<'a, Db>;
type Cf<'a> = Arc<BoundColumnFamily<'a>>;

/// Map a `RocksDB` error, classifying lock contention as transient.
fn db_err(e: rocksdb::Error) -> StoreError {
    match e.kind() {
        ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => {
            StoreError::Transient(e.to_string())
        }
        _ => StoreError::Database(e.to_string()),
    }
}

/// RocksDB-backed storage implementation.
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<Db>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = Db::open_cf_descriptors(
            &opts,
            &TransactionDBOptions::default(),
            path,
            cf_descriptors,
        )
        .map_err(db_err)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Cf<'_>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode_ref(value: &[u8]) -> Result<TransactionRef> {
        keys::transaction_ref_from_value(value)
            .ok_or_else(|| StoreError::Serialization("malformed transaction ref".into()))
    }

    /// Read a row and take its exclusive lock for the rest of `txn`.
    fn lock_row(txn: &Txn<'_>, cf: &Cf<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        txn.get_for_update_cf(cf, key, true).map_err(db_err)
    }

    fn lock_value<T: serde::de::DeserializeOwned>(
        txn: &Txn<'_>,
        cf: &Cf<'_>,
        key: &[u8],
    ) -> Result<Option<T>> {
        Self::lock_row(txn, cf, key)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn put_value<T: serde::Serialize>(
        txn: &Txn<'_>,
        cf: &Cf<'_>,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        txn.put_cf(cf, key, Self::serialize(value)?).map_err(db_err)
    }

    /// Lock the balance row, run `f` on the (possibly fresh) record and write
    /// it back.
    fn update_balance<R>(
        &self,
        user_id: &UserId,
        f: impl FnOnce(&mut UserBalance) -> R,
    ) -> Result<(UserBalance, R)> {
        let cf_balances = self.cf(cf::BALANCES)?;
        let key = keys::balance_key(user_id);

        let txn = self.db.transaction();
        let mut balance = Self::lock_value(&txn, &cf_balances, &key)?
            .unwrap_or_else(|| UserBalance::new(*user_id));
        let out = f(&mut balance);
        Self::put_value(&txn, &cf_balances, &key, &balance)?;
        txn.commit().map_err(db_err)?;

        Ok((balance, out))
    }

    /// Claim the unique slots an entry needs, failing if they are taken.
    fn claim_slots(&self, txn: &Txn<'_>, entry: &NewEntry) -> Result<()> {
        if let Some(key) = entry.idempotency_key.as_deref() {
            let cf_idem = self.cf(cf::IDEMPOTENCY_KEYS)?;
            if let Some(existing) = Self::lock_row(txn, &cf_idem, &keys::idempotency_key(key))? {
                return Err(StoreError::DuplicateIdempotencyKey {
                    key: key.to_string(),
                    transaction_ref: Self::decode_ref(&existing)?,
                });
            }
        }

        if let Some(related) = ops::refund_slot(entry) {
            let cf_refunds = self.cf(cf::REFUNDS_BY_RELATED)?;
            if let Some(existing) = Self::lock_row(txn, &cf_refunds, &keys::refund_key(related))? {
                return Err(StoreError::DuplicateRefund {
                    related_transaction_ref: related.to_string(),
                    transaction_ref: Self::decode_ref(&existing)?,
                });
            }
        }

        Ok(())
    }

    /// Write a materialized entry with all of its indexes.
    fn put_entry(&self, txn: &Txn<'_>, entry: &LedgerEntry) -> Result<()> {
        let cf_ledger = self.cf(cf::LEDGER)?;
        let cf_by_user = self.cf(cf::LEDGER_BY_USER)?;

        let entry_key = keys::entry_key(&entry.transaction_ref);
        if Self::lock_row(txn, &cf_ledger, &entry_key)?.is_some() {
            return Err(StoreError::DuplicateTransactionRef(entry.transaction_ref));
        }

        let ref_bytes = entry.transaction_ref.to_bytes();
        Self::put_value(txn, &cf_ledger, &entry_key, entry)?;
        txn.put_cf(
            &cf_by_user,
            keys::user_entry_key(&entry.user_id, &entry.transaction_ref),
            b"",
        )
        .map_err(db_err)?;

        if let Some(key) = entry.idempotency_key.as_deref() {
            let cf_idem = self.cf(cf::IDEMPOTENCY_KEYS)?;
            txn.put_cf(&cf_idem, keys::idempotency_key(key), ref_bytes)
                .map_err(db_err)?;
        }

        if entry.entry_type == EntryType::Refund {
            if let Some(related) = entry.related_transaction_ref.as_deref() {
                let cf_refunds = self.cf(cf::REFUNDS_BY_RELATED)?;
                txn.put_cf(&cf_refunds, keys::refund_key(related), ref_bytes)
                    .map_err(db_err)?;
            }
        }

        Ok(())
    }

    /// Load the entry an index value points at.
    fn entry_by_index(&self, cf_name: &str, key: &[u8]) -> Result<Option<LedgerEntry>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key).map_err(db_err)? {
            Some(value) => self.get_entry(&Self::decode_ref(&value)?),
            None => Ok(None),
        }
    }

    /// A user's entries, oldest first.
    fn entries_oldest_first(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>> {
        let cf_by_user = self.cf(cf::LEDGER_BY_USER)?;
        let prefix = keys::user_entries_prefix(user_id);

        let iter = self.db.iterator_cf(
            &cf_by_user,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        let mut entries = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(db_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(tx_ref) = keys::transaction_ref_from_user_key(&key) else {
                continue;
            };
            if let Some(entry) = self.get_entry(&tx_ref)? {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Lock a job row, run `f` on it and write it back.
    fn update_job_row<R>(
        &self,
        process_id: &ProcessId,
        f: impl FnOnce(&mut GenerationJob) -> (bool, R),
    ) -> Result<(GenerationJob, R)> {
        let cf_jobs = self.cf(cf::JOBS)?;
        let key = keys::job_key(process_id);

        let txn = self.db.transaction();
        let mut job: GenerationJob =
            Self::lock_value(&txn, &cf_jobs, &key)?.ok_or_else(|| StoreError::NotFound {
                entity: "job",
                id: process_id.to_string(),
            })?;
        let (dirty, out) = f(&mut job);
        if dirty {
            Self::put_value(&txn, &cf_jobs, &key, &job)?;
        }
        txn.commit().map_err(db_err)?;

        Ok((job, out))
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Balance Operations
    // =========================================================================

    fn get_balance(&self, user_id: &UserId) -> Result<Option<UserBalance>> {
        let cf = self.cf(cf::BALANCES)?;
        self.db
            .get_cf(&cf, keys::balance_key(user_id))
            .map_err(db_err)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn ensure_balance(&self, user_id: &UserId) -> Result<UserBalance> {
        if let Some(balance) = self.get_balance(user_id)? {
            return Ok(balance);
        }
        self.update_balance(user_id, |_| ()).map(|(b, ())| b)
    }

    fn set_customer_id(&self, user_id: &UserId, customer_id: &str) -> Result<UserBalance> {
        let cf_balances = self.cf(cf::BALANCES)?;
        let cf_customers = self.cf(cf::CUSTOMERS)?;
        let balance_key = keys::balance_key(user_id);

        let txn = self.db.transaction();
        let mut balance = Self::lock_value(&txn, &cf_balances, &balance_key)?
            .unwrap_or_else(|| UserBalance::new(*user_id));

        let customer_key = keys::customer_key(customer_id);
        Self::lock_row(&txn, &cf_customers, &customer_key)?;

        balance.customer_id = Some(customer_id.to_string());
        balance.updated_at = Utc::now();
        Self::put_value(&txn, &cf_balances, &balance_key, &balance)?;
        txn.put_cf(&cf_customers, customer_key, user_id.as_bytes())
            .map_err(db_err)?;
        txn.commit().map_err(db_err)?;

        Ok(balance)
    }

    fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<UserId>> {
        let cf = self.cf(cf::CUSTOMERS)?;
        let Some(value) = self
            .db
            .get_cf(&cf, keys::customer_key(customer_id))
            .map_err(db_err)?
        else {
            return Ok(None);
        };
        let bytes: [u8; 16] = value
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Serialization("malformed user id".into()))?;
        Ok(Some(UserId::from_bytes(bytes)))
    }

    fn set_subscription(
        &self,
        user_id: &UserId,
        subscription: Option<SubscriptionSnapshot>,
    ) -> Result<UserBalance> {
        self.update_balance(user_id, |balance| {
            balance.subscription = subscription;
            balance.updated_at = Utc::now();
        })
        .map(|(b, ())| b)
    }

    fn advance_next_credit_date(
        &self,
        user_id: &UserId,
        subscription_id: &str,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_balance(user_id, |balance| {
            ops::advance_credit_date(balance, subscription_id, next)
        })
        .map(|(_, moved)| moved)
    }

    fn mark_verified(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()> {
        self.update_balance(user_id, |balance| {
            balance.balance_verified_at = Some(at);
        })
        .map(|_| ())
    }

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    fn append_entry(&self, entry: NewEntry) -> Result<LedgerEntry> {
        ops::check_appendable(&entry)?;
        let cf_balances = self.cf(cf::BALANCES)?;
        let balance_key = keys::balance_key(&entry.user_id);

        let txn = self.db.transaction();
        self.claim_slots(&txn, &entry)?;

        let mut balance = Self::lock_value(&txn, &cf_balances, &balance_key)?
            .unwrap_or_else(|| UserBalance::new(entry.user_id));
        ops::check_debit(balance.credits, entry.amount)?;

        let written = LedgerEntry::from_new(entry, balance.credits);
        self.put_entry(&txn, &written)?;
        ops::apply_entry(&mut balance, &written);
        Self::put_value(&txn, &cf_balances, &balance_key, &balance)?;
        txn.commit().map_err(db_err)?;

        debug!(
            user_id = %written.user_id,
            transaction_ref = %written.transaction_ref,
            entry_type = written.entry_type.as_str(),
            amount = written.amount,
            balance = written.balance_after,
            "Ledger entry appended"
        );

        Ok(written)
    }

    fn reverse_entry(
        &self,
        transaction_ref: &TransactionRef,
        description: &str,
        source: EntrySource,
    ) -> Result<LedgerEntry> {
        let cf_idem = self.cf(cf::IDEMPOTENCY_KEYS)?;
        let cf_ledger = self.cf(cf::LEDGER)?;
        let cf_balances = self.cf(cf::BALANCES)?;

        let txn = self.db.transaction();

        let reversal_key = ops::reversal_key(transaction_ref);
        if let Some(existing) =
            Self::lock_row(&txn, &cf_idem, &keys::idempotency_key(&reversal_key))?
        {
            return Err(StoreError::DuplicateIdempotencyKey {
                key: reversal_key,
                transaction_ref: Self::decode_ref(&existing)?,
            });
        }

        let original_key = keys::entry_key(transaction_ref);
        let mut original: LedgerEntry = Self::lock_value(&txn, &cf_ledger, &original_key)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "ledger entry",
                id: transaction_ref.to_string(),
            })?;
        let rollback = ops::rollback_for(&original, description, source)?;

        let balance_key = keys::balance_key(&original.user_id);
        let mut balance = Self::lock_value(&txn, &cf_balances, &balance_key)?
            .unwrap_or_else(|| UserBalance::new(original.user_id));
        ops::check_debit(balance.credits, rollback.amount)?;

        let written = LedgerEntry::from_new(rollback, balance.credits);
        original.status = EntryStatus::Reversed;
        Self::put_value(&txn, &cf_ledger, &original_key, &original)?;
        self.put_entry(&txn, &written)?;
        ops::apply_entry(&mut balance, &written);
        Self::put_value(&txn, &cf_balances, &balance_key, &balance)?;
        txn.commit().map_err(db_err)?;

        debug!(
            user_id = %written.user_id,
            transaction_ref = %written.transaction_ref,
            reversed = %transaction_ref,
            amount = written.amount,
            balance = written.balance_after,
            "Ledger entry reversed"
        );

        Ok(written)
    }

    fn get_entry(&self, transaction_ref: &TransactionRef) -> Result<Option<LedgerEntry>> {
        let cf = self.cf(cf::LEDGER)?;
        self.db
            .get_cf(&cf, keys::entry_key(transaction_ref))
            .map_err(db_err)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<LedgerEntry>> {
        self.entry_by_index(cf::IDEMPOTENCY_KEYS, &keys::idempotency_key(key))
    }

    fn find_refund(&self, related_transaction_ref: &str) -> Result<Option<LedgerEntry>> {
        self.entry_by_index(cf::REFUNDS_BY_RELATED, &keys::refund_key(related_transaction_ref))
    }

    fn list_entries(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>> {
        let mut entries = self.entries_oldest_first(user_id)?;
        entries.reverse();
        Ok(entries)
    }

    fn rebuild_balance(&self, user_id: &UserId) -> Result<BalanceRebuild> {
        let cf_balances = self.cf(cf::BALANCES)?;
        let key = keys::balance_key(user_id);

        // Holding the balance lock keeps appends for this user out until the
        // rebuilt value is committed.
        let txn = self.db.transaction();
        let mut balance = Self::lock_value(&txn, &cf_balances, &key)?
            .unwrap_or_else(|| UserBalance::new(*user_id));
        let previous = balance.credits;
        let rebuilt = ledger_sum(&self.entries_oldest_first(user_id)?);

        balance.credits = rebuilt;
        balance.updated_at = Utc::now();
        Self::put_value(&txn, &cf_balances, &key, &balance)?;
        txn.commit().map_err(db_err)?;

        Ok(BalanceRebuild {
            user_id: *user_id,
            previous,
            rebuilt,
        })
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    fn create_job(&self, job: &GenerationJob) -> Result<()> {
        let cf_jobs = self.cf(cf::JOBS)?;
        let key = keys::job_key(&job.process_id);

        let txn = self.db.transaction();
        if Self::lock_row(&txn, &cf_jobs, &key)?.is_some() {
            return Err(StoreError::DuplicateJob {
                process_id: job.process_id.to_string(),
            });
        }
        Self::put_value(&txn, &cf_jobs, &key, job)?;
        txn.commit().map_err(db_err)?;

        Ok(())
    }

    fn get_job(&self, process_id: &ProcessId) -> Result<Option<GenerationJob>> {
        let cf = self.cf(cf::JOBS)?;
        self.db
            .get_cf(&cf, keys::job_key(process_id))
            .map_err(db_err)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn update_job(&self, process_id: &ProcessId, progress: &JobProgress) -> Result<JobUpdate> {
        let (job, transition) = self.update_job_row(process_id, |job| {
            let transition = job.apply_progress(progress);
            (transition != Transition::Unchanged, transition)
        })?;
        Ok(JobUpdate { job, transition })
    }

    fn attach_refund(
        &self,
        process_id: &ProcessId,
        refund_transaction_ref: TransactionRef,
    ) -> Result<GenerationJob> {
        self.update_job_row(process_id, |job| {
            if job.refund_transaction_ref.is_some() {
                return (false, ());
            }
            job.refund_transaction_ref = Some(refund_transaction_ref);
            job.updated_at = Utc::now();
            (true, ())
        })
        .map(|(job, ())| job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let user_id = UserId::generate();

        let written = {
            let store = RocksStore::open(dir.path()).unwrap();
            store
                .append_entry(NewEntry::credit(
                    user_id,
                    EntryType::Bonus,
                    700,
                    EntrySource::Admin,
                    "Welcome",
                ))
                .unwrap()
        };

        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.get_balance(&user_id).unwrap().unwrap().credits, 700);
        assert_eq!(
            store.get_entry(&written.transaction_ref).unwrap().unwrap(),
            written
        );
    }

    #[test]
    fn customer_index_round_trips() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        store.set_customer_id(&user_id, "ctm_123").unwrap();
        assert_eq!(
            store.find_user_by_customer("ctm_123").unwrap(),
            Some(user_id)
        );
        assert_eq!(store.find_user_by_customer("ctm_999").unwrap(), None);
    }

    #[test]
    fn failed_unit_leaves_nothing_behind() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        let err = store
            .append_entry(
                NewEntry::deduction(user_id, 10, "job").with_idempotency_key(Some("k1".into())),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InsufficientBalance { .. }));

        assert!(store.find_by_idempotency_key("k1").unwrap().is_none());
        assert!(store.list_entries(&user_id).unwrap().is_empty());
        assert!(store.get_balance(&user_id).unwrap().is_none());
    }
}
