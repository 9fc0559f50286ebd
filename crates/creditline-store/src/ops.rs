//! Backend-independent rules applied inside every atomic unit.

use chrono::{DateTime, Utc};
use creditline_core::{
    EntrySource, EntryStatus, EntryType, LedgerEntry, NewEntry, TransactionRef, UserBalance,
};

use crate::error::{Result, StoreError};

/// Idempotency key of the rollback entry that reverses `transaction_ref`.
#[must_use]
pub fn reversal_key(transaction_ref: &TransactionRef) -> String {
    format!("reversal:{transaction_ref}")
}

/// Reject entries that `append_entry` must not write.
pub(crate) fn check_appendable(entry: &NewEntry) -> Result<()> {
    match entry.entry_type {
        EntryType::Rollback => Err(StoreError::InvalidState(
            "rollback entries are written by reverse_entry".into(),
        )),
        EntryType::Refund if entry.related_transaction_ref.is_none() => Err(
            StoreError::InvalidState("refund requires a related transaction ref".into()),
        ),
        _ => Ok(()),
    }
}

/// The refund slot an entry claims, if any.
pub(crate) fn refund_slot(entry: &NewEntry) -> Option<&str> {
    if entry.entry_type == EntryType::Refund {
        entry.related_transaction_ref.as_deref()
    } else {
        None
    }
}

/// Reject a debit that would drive `balance` below zero.
pub(crate) fn check_debit(balance: i64, amount: i64) -> Result<()> {
    if amount < 0 && balance + amount < 0 {
        return Err(StoreError::InsufficientBalance {
            balance,
            required: -amount,
        });
    }
    Ok(())
}

/// Build the rollback entry for `original`.
pub(crate) fn rollback_for(
    original: &LedgerEntry,
    description: &str,
    source: EntrySource,
) -> Result<NewEntry> {
    if original.entry_type == EntryType::Rollback {
        return Err(StoreError::InvalidState(format!(
            "{} is a rollback and cannot be reversed",
            original.transaction_ref
        )));
    }
    if original.status != EntryStatus::Completed {
        return Err(StoreError::InvalidState(format!(
            "{} is {:?}, only completed entries can be reversed",
            original.transaction_ref, original.status
        )));
    }

    Ok(NewEntry {
        user_id: original.user_id,
        entry_type: EntryType::Rollback,
        amount: -original.amount,
        source,
        description: description.to_string(),
        idempotency_key: Some(reversal_key(&original.transaction_ref)),
        related_transaction_ref: Some(original.transaction_ref.to_string()),
        usage_details: None,
        metadata: serde_json::json!({ "reversed_type": original.entry_type.as_str() }),
    })
}

/// Apply a written entry to the cached balance.
pub(crate) fn apply_entry(balance: &mut UserBalance, entry: &LedgerEntry) {
    balance.credits = entry.balance_after;
    balance.updated_at = entry.created_at;
}

/// Advance the snapshot's next credit date if it still belongs to
/// `subscription_id` and moves forward.
pub(crate) fn advance_credit_date(
    balance: &mut UserBalance,
    subscription_id: &str,
    next: DateTime<Utc>,
) -> bool {
    let Some(sub) = balance
        .subscription
        .as_mut()
        .filter(|s| s.subscription_id == subscription_id)
    else {
        return false;
    };
    if sub.next_credit_date.is_some_and(|current| current >= next) {
        return false;
    }
    sub.next_credit_date = Some(next);
    balance.updated_at = Utc::now();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditline_core::UserId;

    #[test]
    fn debit_check_allows_exact_balance() {
        assert!(check_debit(100, -100).is_ok());
        assert!(matches!(
            check_debit(99, -100),
            Err(StoreError::InsufficientBalance {
                balance: 99,
                required: 100
            })
        ));
        assert!(check_debit(0, 50).is_ok());
    }

    #[test]
    fn rollback_negates_and_links() {
        let user = UserId::generate();
        let original = LedgerEntry::from_new(
            NewEntry::credit(user, EntryType::Bonus, 300, EntrySource::Admin, "promo"),
            0,
        );
        let rollback = rollback_for(&original, "clawback", EntrySource::Admin).unwrap();
        assert_eq!(rollback.amount, -300);
        assert_eq!(rollback.entry_type, EntryType::Rollback);
        assert_eq!(
            rollback.related_transaction_ref,
            Some(original.transaction_ref.to_string())
        );
        assert_eq!(
            rollback.idempotency_key,
            Some(reversal_key(&original.transaction_ref))
        );
    }

    #[test]
    fn rollbacks_and_reversed_entries_are_not_reversible() {
        let user = UserId::generate();
        let mut original = LedgerEntry::from_new(NewEntry::deduction(user, 10, "job"), 10);
        original.status = EntryStatus::Reversed;
        assert!(matches!(
            rollback_for(&original, "x", EntrySource::Admin),
            Err(StoreError::InvalidState(_))
        ));

        original.status = EntryStatus::Completed;
        original.entry_type = EntryType::Rollback;
        assert!(matches!(
            rollback_for(&original, "x", EntrySource::Admin),
            Err(StoreError::InvalidState(_))
        ));
    }

    #[test]
    fn refunds_need_a_related_ref() {
        let user = UserId::generate();
        let mut refund = NewEntry::refund(user, 10, "r", EntrySource::System, "refund");
        assert!(check_appendable(&refund).is_ok());
        assert_eq!(refund_slot(&refund), Some("r"));

        refund.related_transaction_ref = None;
        assert!(check_appendable(&refund).is_err());
    }
}
