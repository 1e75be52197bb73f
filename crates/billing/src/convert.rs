//! Stripe objects to provider-neutral remote records
//!
//! Used by both the listing path and webhook decoding, so a given Stripe object
//! always means the same thing locally.

use std::collections::HashMap;

use stripe::{Expandable, PriceType, RecurringInterval, SubscriptionStatus};

use crate::entities::PricingSchedule;
use crate::provider::{RemoteCustomer, RemotePlan, RemotePrice, RemoteSubscription};

/// Metadata key linking a Stripe object to an application user
pub const USER_ID_METADATA_KEY: &str = "user_id";

fn user_id_from(metadata: Option<&HashMap<String, String>>) -> Option<i64> {
    metadata
        .and_then(|m| m.get(USER_ID_METADATA_KEY))
        .and_then(|v| v.trim().parse().ok())
}

pub fn customer(customer: &stripe::Customer) -> RemoteCustomer {
    RemoteCustomer {
        id: customer.id.to_string(),
        name: customer.name.clone().unwrap_or_default(),
        email: customer.email.clone().unwrap_or_default(),
        user_id: user_id_from(customer.metadata.as_ref()),
    }
}

pub fn plan(product: &stripe::Product) -> RemotePlan {
    RemotePlan {
        id: product.id.to_string(),
        name: product.name.clone().unwrap_or_default(),
        description: product.description.clone().filter(|d| !d.is_empty()),
        active: product.active.unwrap_or(false),
    }
}

pub fn price(price: &stripe::Price) -> RemotePrice {
    let product_id = price.product.as_ref().map(|product| match product {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(product) => product.id.to_string(),
    });

    let schedule = match (&price.type_, &price.recurring) {
        (Some(PriceType::OneTime), _) => Some(PricingSchedule::OneTime),
        (_, Some(recurring)) => match recurring.interval {
            RecurringInterval::Month => Some(PricingSchedule::Monthly),
            RecurringInterval::Year => Some(PricingSchedule::Annual),
            _ => None,
        },
        (_, None) => Some(PricingSchedule::OneTime),
    };

    let trial_days = price
        .recurring
        .as_ref()
        .and_then(|r| r.trial_period_days)
        .map(|days| i32::try_from(days).unwrap_or(i32::MAX))
        .unwrap_or(0);

    RemotePrice {
        id: price.id.to_string(),
        product_id,
        amount: price.unit_amount.unwrap_or(0),
        currency: price
            .currency
            .as_ref()
            .map(|c| c.to_string().to_lowercase())
            .unwrap_or_default(),
        schedule,
        trial_days,
    }
}

pub fn subscription(subscription: &stripe::Subscription) -> RemoteSubscription {
    let customer_id = match &subscription.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    };

    let price_id = subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    RemoteSubscription {
        id: subscription.id.to_string(),
        customer_id,
        price_id,
        active: matches!(
            subscription.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ),
        user_id: user_id_from(Some(&subscription.metadata)),
    }
}
