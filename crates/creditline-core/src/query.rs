//! Filtered, paginated views over a user's ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntryType, LedgerEntry};

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: usize = 200;

/// Credit or debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Positive amounts.
    Credit,
    /// Negative amounts.
    Debit,
}

/// Filter and pagination for a ledger listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerQuery {
    /// Only entries of this type.
    pub entry_type: Option<EntryType>,
    /// Only entries created at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Only entries created before this instant.
    pub to: Option<DateTime<Utc>>,
    /// Only credits or only debits.
    pub direction: Option<Direction>,
    /// Case-insensitive substring of the description.
    pub search: Option<String>,
    /// Page size.
    pub limit: usize,
    /// Entries to skip.
    pub offset: usize,
}

impl Default for LedgerQuery {
    fn default() -> Self {
        Self {
            entry_type: None,
            from: None,
            to: None,
            direction: None,
            search: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl LedgerQuery {
    /// Whether `entry` passes every filter.
    #[must_use]
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if self.entry_type.is_some_and(|t| t != entry.entry_type) {
            return false;
        }
        if self.from.is_some_and(|from| entry.created_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| entry.created_at >= to) {
            return false;
        }
        match self.direction {
            Some(Direction::Credit) if !entry.is_credit() => return false,
            Some(Direction::Debit) if !entry.is_debit() => return false,
            _ => {}
        }
        if let Some(needle) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let needle = needle.to_lowercase();
            if !entry.description.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }

    /// Filter `entries` (newest first), summarize the whole filtered set and
    /// cut the requested page out of it.
    #[must_use]
    pub fn apply(&self, entries: Vec<LedgerEntry>) -> LedgerPage {
        let limit = self.limit.clamp(1, MAX_PAGE_SIZE);
        let filtered: Vec<LedgerEntry> = entries.into_iter().filter(|e| self.matches(e)).collect();

        let summary = LedgerSummary::of(&filtered);
        let total = filtered.len();
        let page: Vec<LedgerEntry> = filtered.into_iter().skip(self.offset).take(limit).collect();
        let has_more = self.offset + page.len() < total;

        LedgerPage {
            entries: page,
            total,
            has_more,
            summary,
        }
    }
}

/// Aggregate over a filtered ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    /// Sum of positive amounts.
    pub total_credited: i64,
    /// Sum of negative amounts, as a positive number.
    pub total_debited: i64,
    /// `total_credited - total_debited`.
    pub net_change: i64,
}

impl LedgerSummary {
    /// Summarize `entries`.
    #[must_use]
    pub fn of(entries: &[LedgerEntry]) -> Self {
        let (credited, debited) = entries.iter().fold((0i64, 0i64), |(c, d), e| {
            if e.amount >= 0 {
                (c + e.amount, d)
            } else {
                (c, d - e.amount)
            }
        });
        Self {
            total_credited: credited,
            total_debited: debited,
            net_change: credited - debited,
        }
    }
}

/// One page of a ledger listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPage {
    /// Entries on this page, newest first.
    pub entries: Vec<LedgerEntry>,
    /// Entries matching the filter across all pages.
    pub total: usize,
    /// Whether later pages exist.
    pub has_more: bool,
    /// Aggregate over all matching entries.
    pub summary: LedgerSummary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntrySource, NewEntry, UserId};
    use chrono::Duration;

    fn ledger() -> Vec<LedgerEntry> {
        let user = UserId::generate();
        let mut entries = vec![
            LedgerEntry::from_new(
                NewEntry::credit(user, EntryType::SubscriptionCredit, 1000, EntrySource::Webhook, "Pro plan credits"),
                0,
            ),
            LedgerEntry::from_new(NewEntry::deduction(user, 100, "Image generation"), 1000),
            LedgerEntry::from_new(
                NewEntry::refund(user, 100, "x", EntrySource::System, "Refund for failed image job"),
                900,
            ),
            LedgerEntry::from_new(NewEntry::deduction(user, 50, "Video generation"), 1000),
        ];
        let base = Utc::now() - Duration::days(10);
        for (i, e) in entries.iter_mut().enumerate() {
            e.created_at = base + Duration::days(i64::try_from(i).unwrap());
        }
        entries.reverse();
        entries
    }

    #[test]
    fn unfiltered_summary_nets_out() {
        let page = LedgerQuery::default().apply(ledger());
        assert_eq!(page.total, 4);
        assert!(!page.has_more);
        assert_eq!(page.summary.total_credited, 1100);
        assert_eq!(page.summary.total_debited, 150);
        assert_eq!(page.summary.net_change, 950);
        assert_eq!(page.entries[0].description, "Video generation");
    }

    #[test]
    fn direction_and_search_filters() {
        let query = LedgerQuery {
            direction: Some(Direction::Debit),
            ..LedgerQuery::default()
        };
        let page = query.apply(ledger());
        assert_eq!(page.total, 2);
        assert_eq!(page.summary.total_credited, 0);

        let query = LedgerQuery {
            search: Some("IMAGE".into()),
            ..LedgerQuery::default()
        };
        let page = query.apply(ledger());
        assert_eq!(page.total, 2);
        assert_eq!(page.summary.net_change, 0);
    }

    #[test]
    fn type_and_date_range_filters() {
        let entries = ledger();
        let from = entries[2].created_at;
        let to = entries[0].created_at;
        let query = LedgerQuery {
            from: Some(from),
            to: Some(to),
            ..LedgerQuery::default()
        };
        let page = query.apply(entries);
        assert_eq!(page.total, 2);

        let query = LedgerQuery {
            entry_type: Some(EntryType::Refund),
            ..LedgerQuery::default()
        };
        assert_eq!(query.apply(ledger()).total, 1);
    }

    #[test]
    fn pagination_reports_has_more_and_keeps_summary_over_all_pages() {
        let query = LedgerQuery {
            limit: 3,
            offset: 0,
            ..LedgerQuery::default()
        };
        let page = query.apply(ledger());
        assert_eq!(page.entries.len(), 3);
        assert!(page.has_more);
        assert_eq!(page.summary.net_change, 950);

        let query = LedgerQuery {
            limit: 3,
            offset: 3,
            ..LedgerQuery::default()
        };
        let page = query.apply(ledger());
        assert_eq!(page.entries.len(), 1);
        assert!(!page.has_more);
    }
}
