//! Plan catalog: which provider prices grant how many credits.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{BillingCycle, Plan};

/// Maps provider price ids to what they sell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCatalog {
    /// Known prices, keyed by provider price id.
    pub prices: HashMap<String, PriceKind>,
}

/// What a price sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriceKind {
    /// A recurring plan.
    Subscription {
        /// Plan tier.
        plan: Plan,
        /// How often it is charged.
        billing_cycle: BillingCycle,
    },
    /// A one-off credit pack.
    Addon {
        /// Credits per unit.
        credits: i64,
    },
}

/// One line of a provider transaction or subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLine {
    /// Provider price id.
    pub price_id: String,
    /// Units purchased.
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let mut prices = HashMap::new();
        for (plan, key) in [
            (Plan::Starter, "starter"),
            (Plan::Pro, "pro"),
            (Plan::Business, "business"),
        ] {
            prices.insert(
                format!("pri_{key}_monthly"),
                PriceKind::Subscription {
                    plan,
                    billing_cycle: BillingCycle::Monthly,
                },
            );
            prices.insert(
                format!("pri_{key}_annual"),
                PriceKind::Subscription {
                    plan,
                    billing_cycle: BillingCycle::Annual,
                },
            );
        }
        prices.insert("pri_pack_500".into(), PriceKind::Addon { credits: 500 });
        prices.insert("pri_pack_2500".into(), PriceKind::Addon { credits: 2_500 });
        Self { prices }
    }
}

impl PlanCatalog {
    /// Look up a price.
    #[must_use]
    pub fn lookup(&self, price_id: &str) -> Option<PriceKind> {
        self.prices.get(price_id).copied()
    }

    /// The plan sold by the first subscription line in `lines`.
    #[must_use]
    pub fn subscription_plan(&self, lines: &[PriceLine]) -> Option<(Plan, BillingCycle)> {
        lines.iter().find_map(|line| match self.lookup(&line.price_id) {
            Some(PriceKind::Subscription {
                plan,
                billing_cycle,
            }) => Some((plan, billing_cycle)),
            _ => None,
        })
    }

    /// Whether any line is a one-off credit pack.
    #[must_use]
    pub fn has_addon(&self, lines: &[PriceLine]) -> bool {
        lines
            .iter()
            .any(|l| matches!(self.lookup(&l.price_id), Some(PriceKind::Addon { .. })))
    }

    /// Credits a paid transaction with these lines grants immediately.
    ///
    /// Subscriptions grant one month of credits per charge; annual plans
    /// receive the remaining months through the monthly credit job. Unknown
    /// prices grant nothing.
    #[must_use]
    pub fn credits_for(&self, lines: &[PriceLine]) -> i64 {
        lines
            .iter()
            .map(|line| {
                let per_unit = match self.lookup(&line.price_id) {
                    Some(PriceKind::Subscription { plan, .. }) => plan.monthly_credits(),
                    Some(PriceKind::Addon { credits }) => credits,
                    None => 0,
                };
                per_unit * i64::from(line.quantity)
            })
            .sum()
    }
}
