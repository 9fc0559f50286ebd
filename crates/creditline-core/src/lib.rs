//! Core types for creditline.
//!
//! This crate holds the domain model shared by the store, the engine and the
//! HTTP service:
//!
//! - **Identifiers**: `UserId`, `TransactionRef`, `ProcessId`
//! - **Ledger**: `LedgerEntry`, `NewEntry`, `EntryType`, `EntryStatus`, `EntrySource`
//! - **Balances**: `UserBalance`, `SubscriptionSnapshot`, `Plan`, `BillingCycle`
//! - **Jobs**: `GenerationJob`, `JobProgress`, `Transition`
//! - **Queries**: `LedgerQuery`, `LedgerPage`, `LedgerSummary`
//! - **Plans**: `PlanCatalog`, `PriceKind`, `PriceLine`
//!
//! # Credits
//!
//! Credits are whole units stored as `i64`. There is no currency and no
//! fractional credit anywhere in the system.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod ids;
pub mod job;
pub mod ledger;
pub mod plans;
pub mod query;

pub use balance::{
    BillingCycle, Plan, SubscriptionSnapshot, SubscriptionStatus, UserBalance,
    BUSINESS_PLAN_CREDITS, PRO_PLAN_CREDITS, STARTER_PLAN_CREDITS,
};
pub use ids::{IdError, ProcessId, TransactionRef, UserId};
pub use job::{GenerationJob, JobProgress, JobStatus, Transition};
pub use ledger::{
    ledger_sum, EntrySource, EntryStatus, EntryType, LedgerEntry, NewEntry, UsageDetails,
};
pub use plans::{PlanCatalog, PriceKind, PriceLine};
pub use query::{Direction, LedgerPage, LedgerQuery, LedgerSummary, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
