//! Mirrored billing entities
//!
//! Every row carries a mirror-local internal id plus its external identity,
//! the `(provider, provider_id)` pair both sync paths join on.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Mirror-local primary key, assigned on first insert
pub type InternalId = i64;

/// The four mirrored entity types, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Customer,
    Plan,
    Price,
    Subscription,
}

impl EntityKind {
    /// Write order: parents before the rows that reference them
    pub const DEPENDENCY_ORDER: [EntityKind; 4] = [
        EntityKind::Customer,
        EntityKind::Plan,
        EntityKind::Price,
        EntityKind::Subscription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customer",
            EntityKind::Plan => "plan",
            EntityKind::Price => "price",
            EntityKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common shape of every mirrored row.
pub trait MirrorEntity: Clone + fmt::Debug + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> InternalId;
    fn set_id(&mut self, id: InternalId);
    fn provider(&self) -> &str;
    fn provider_id(&self) -> &str;

    /// Compares business columns only; the internal id is ignored.
    fn same_business_fields(&self, other: &Self) -> bool;

    /// Copies mirror-local state from the stored row onto a freshly converted one.
    fn carry_local(&mut self, stored: &Self) {
        self.set_id(stored.id());
    }

    /// Foreign keys this row holds
    fn parents(&self) -> Vec<(EntityKind, InternalId)> {
        Vec::new()
    }

    /// Whether this row holds a foreign key to `(kind, id)`.
    fn references(&self, kind: EntityKind, id: InternalId) -> bool {
        self.parents().contains(&(kind, id))
    }
}

/// Billing customer, optionally linked to an application user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Customer {
    pub id: InternalId,
    pub user_id: Option<i64>,
    pub provider: String,
    pub provider_id: String,
    pub name: String,
    pub email: String,
}

impl Customer {
    pub fn has_user(&self) -> bool {
        self.user_id.is_some()
    }
}

impl MirrorEntity for Customer {
    const KIND: EntityKind = EntityKind::Customer;

    fn id(&self) -> InternalId {
        self.id
    }

    fn set_id(&mut self, id: InternalId) {
        self.id = id;
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn same_business_fields(&self, other: &Self) -> bool {
        self.name == other.name && self.email == other.email && self.user_id == other.user_id
    }

    fn carry_local(&mut self, stored: &Self) {
        self.id = stored.id;
        // The user link may be set locally after checkout; a remote record without one keeps it.
        if self.user_id.is_none() {
            self.user_id = stored.user_id;
        }
    }
}

/// Product offered by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: InternalId,
    pub provider: String,
    pub provider_id: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
}

impl MirrorEntity for Plan {
    const KIND: EntityKind = EntityKind::Plan;

    fn id(&self) -> InternalId {
        self.id
    }

    fn set_id(&mut self, id: InternalId) {
        self.id = id;
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn same_business_fields(&self, other: &Self) -> bool {
        self.name == other.name && self.description == other.description && self.active == other.active
    }
}

/// Billing schedule of a price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingSchedule {
    #[serde(rename = "once")]
    OneTime,
    Monthly,
    Annual,
}

impl PricingSchedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingSchedule::OneTime => "once",
            PricingSchedule::Monthly => "monthly",
            PricingSchedule::Annual => "annual",
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, PricingSchedule::OneTime)
    }
}

impl fmt::Display for PricingSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for PricingSchedule {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "once" => Ok(PricingSchedule::OneTime),
            "monthly" => Ok(PricingSchedule::Monthly),
            "annual" => Ok(PricingSchedule::Annual),
            other => Err(format!("unknown pricing schedule: {other}")),
        }
    }
}

/// A price point of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Price {
    pub id: InternalId,
    pub plan_id: InternalId,
    pub provider: String,
    pub provider_id: String,
    /// Smallest currency unit
    pub amount: i64,
    /// Lowercase ISO 4217 code
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub schedule: PricingSchedule,
    pub trial_days: i32,
}

impl Price {
    pub fn has_trial(&self) -> bool {
        self.trial_days > 0
    }

    /// End of the trial for a subscription starting at `from`.
    pub fn trial_end(&self, from: OffsetDateTime) -> Option<OffsetDateTime> {
        self.has_trial()
            .then(|| from + Duration::days(i64::from(self.trial_days)))
    }
}

impl MirrorEntity for Price {
    const KIND: EntityKind = EntityKind::Price;

    fn id(&self) -> InternalId {
        self.id
    }

    fn set_id(&mut self, id: InternalId) {
        self.id = id;
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn same_business_fields(&self, other: &Self) -> bool {
        self.plan_id == other.plan_id
            && self.amount == other.amount
            && self.currency == other.currency
            && self.schedule == other.schedule
            && self.trial_days == other.trial_days
    }

    fn parents(&self) -> Vec<(EntityKind, InternalId)> {
        vec![(EntityKind::Plan, self.plan_id)]
    }
}

/// A customer's subscription to a price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: InternalId,
    pub customer_id: InternalId,
    pub price_id: InternalId,
    pub provider: String,
    pub provider_id: String,
    pub active: bool,
}

impl MirrorEntity for Subscription {
    const KIND: EntityKind = EntityKind::Subscription;

    fn id(&self) -> InternalId {
        self.id
    }

    fn set_id(&mut self, id: InternalId) {
        self.id = id;
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn same_business_fields(&self, other: &Self) -> bool {
        self.customer_id == other.customer_id
            && self.price_id == other.price_id
            && self.active == other.active
    }

    fn parents(&self) -> Vec<(EntityKind, InternalId)> {
        vec![
            (EntityKind::Customer, self.customer_id),
            (EntityKind::Price, self.price_id),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer(user_id: Option<i64>) -> Customer {
        Customer {
            id: 0,
            user_id,
            provider: "stripe".into(),
            provider_id: "cus_1".into(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
        }
    }

    #[test]
    fn test_carry_local_keeps_id_and_user_link() {
        let stored = Customer { id: 7, ..customer(Some(42)) };
        let mut fresh = customer(None);
        fresh.carry_local(&stored);
        assert_eq!(fresh.id, 7);
        assert_eq!(fresh.user_id, Some(42));
        assert!(fresh.same_business_fields(&stored));
    }

    #[test]
    fn test_remote_user_link_wins() {
        let stored = Customer { id: 7, ..customer(Some(42)) };
        let mut fresh = customer(Some(43));
        fresh.carry_local(&stored);
        assert!(!fresh.same_business_fields(&stored));
    }

    #[test]
    fn test_business_comparison_ignores_internal_id() {
        let a = Plan {
            id: 1,
            provider: "stripe".into(),
            provider_id: "prod_1".into(),
            name: "Pro".into(),
            description: None,
            active: true,
        };
        let b = Plan { id: 99, ..a.clone() };
        assert!(a.same_business_fields(&b));
        let c = Plan { active: false, ..a.clone() };
        assert!(!a.same_business_fields(&c));
    }

    #[test]
    fn test_schedule_strings() {
        for schedule in [PricingSchedule::OneTime, PricingSchedule::Monthly, PricingSchedule::Annual] {
            assert_eq!(PricingSchedule::try_from(schedule.as_str().to_string()), Ok(schedule));
        }
        assert!(PricingSchedule::try_from("weekly".to_string()).is_err());
        assert!(!PricingSchedule::OneTime.is_recurring());
    }

    #[test]
    fn test_trial_end() {
        let price = Price {
            id: 1,
            plan_id: 1,
            provider: "stripe".into(),
            provider_id: "price_1".into(),
            amount: 2900,
            currency: "usd".into(),
            schedule: PricingSchedule::Monthly,
            trial_days: 14,
        };
        let start = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(price.trial_end(start), Some(start + Duration::days(14)));
        let no_trial = Price { trial_days: 0, ..price };
        assert_eq!(no_trial.trial_end(start), None);
    }

    #[test]
    fn test_subscription_references() {
        let sub = Subscription {
            id: 1,
            customer_id: 3,
            price_id: 5,
            provider: "stripe".into(),
            provider_id: "sub_1".into(),
            active: true,
        };
        assert!(sub.references(EntityKind::Customer, 3));
        assert!(sub.references(EntityKind::Price, 5));
        assert!(!sub.references(EntityKind::Plan, 5));
    }
}
