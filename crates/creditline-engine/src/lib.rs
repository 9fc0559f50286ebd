//! Credit accounting engine for creditline.
//!
//! - [`CreditService`]: the only writer of balances. Grants, deductions,
//!   refunds, reversals, verification and monthly grants.
//! - [`JobTracker`]: reserves credits when a generation job starts, follows
//!   its progress and refunds the reservation if the job fails.
//! - [`Reconciler`]: read-path sweep that compares local state with the
//!   billing provider and replays what the webhooks missed.
//! - [`BillingEventProcessor`]: applies decoded provider webhooks.
//!
//! Correctness rests on the store's atomic units plus two uniqueness
//! guarantees: idempotency keys on grants and one refund per related
//! transaction. Nothing here takes in-process locks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod credits;
pub mod error;
pub mod events;
pub mod jobs;
pub mod notify;
pub mod provider;
pub mod reconcile;
pub mod retry;

pub use credits::{
    monthly_credit_key, BalanceCheck, CreditGrant, CreditResult, CreditService, Deduction,
    RefundRequest, MAX_MONTHLY_CATCH_UP,
};
pub use error::{CreditError, Result};
pub use events::{BillingEvent, BillingEventProcessor, EventOutcome, SubscriptionEventKind};
pub use jobs::{job_debit_key, JobStart, JobTracker, StartJob};
pub use notify::{dispatch, JobNotification, NoopNotifier, Notifier, NotifyError};
pub use provider::{
    credit_for_transaction, BillingProvider, ProviderError, ProviderSubscription,
    ProviderTransaction, ProviderTransactionStatus, TransactionCredit,
};
pub use reconcile::{Reconciler, SweepOutcome, SyncReport};
pub use retry::RetryPolicy;
