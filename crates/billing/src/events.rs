//! Mirror change notifications
//!
//! An [`EventBus`] holds typed observer lists per entity type. Observers are
//! registered while the bus is being built (`&mut self`), then the bus is shared
//! behind an `Arc` and invoked synchronously by whichever path wrote the row.
//! There is no queueing and no replay; an observer sees a change only if it was
//! registered before the change happened.
//!
//! Observers run inline on the writer's task, so they must be quick and must not
//! panic.

use std::fmt;
use std::sync::Arc;

use crate::entities::{Customer, MirrorEntity, Plan, Price, Subscription};

/// Receives changes of one entity type. Every method defaults to a no-op.
pub trait MirrorObserver<E>: Send + Sync {
    fn on_added(&self, _current: &E) {}

    fn on_updated(&self, _previous: &E, _current: &E) {}

    /// `last` is the final stored snapshot.
    fn on_removed(&self, _last: &E) {}
}

struct OnAdded<F>(F);

impl<E, F: Fn(&E) + Send + Sync> MirrorObserver<E> for OnAdded<F> {
    fn on_added(&self, current: &E) {
        (self.0)(current)
    }
}

struct OnUpdated<F>(F);

impl<E, F: Fn(&E, &E) + Send + Sync> MirrorObserver<E> for OnUpdated<F> {
    fn on_updated(&self, previous: &E, current: &E) {
        (self.0)(previous, current)
    }
}

struct OnRemoved<F>(F);

impl<E, F: Fn(&E) + Send + Sync> MirrorObserver<E> for OnRemoved<F> {
    fn on_removed(&self, last: &E) {
        (self.0)(last)
    }
}

pub struct ObserverRegistry<E> {
    observers: Vec<Arc<dyn MirrorObserver<E>>>,
}

impl<E> Default for ObserverRegistry<E> {
    fn default() -> Self {
        Self {
            observers: Vec::new(),
        }
    }
}

impl<E> ObserverRegistry<E> {
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

/// Entity types the bus carries
pub trait Observed: MirrorEntity {
    fn registry(bus: &EventBus) -> &ObserverRegistry<Self>;
    fn registry_mut(bus: &mut EventBus) -> &mut ObserverRegistry<Self>;
}

macro_rules! observed {
    ($entity:ty, $field:ident) => {
        impl Observed for $entity {
            fn registry(bus: &EventBus) -> &ObserverRegistry<Self> {
                &bus.$field
            }

            fn registry_mut(bus: &mut EventBus) -> &mut ObserverRegistry<Self> {
                &mut bus.$field
            }
        }
    };
}

observed!(Customer, customers);
observed!(Plan, plans);
observed!(Price, prices);
observed!(Subscription, subscriptions);

#[derive(Default)]
pub struct EventBus {
    customers: ObserverRegistry<Customer>,
    plans: ObserverRegistry<Plan>,
    prices: ObserverRegistry<Price>,
    subscriptions: ObserverRegistry<Subscription>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<E: Observed>(&mut self, observer: Arc<dyn MirrorObserver<E>>) -> &mut Self {
        E::registry_mut(self).observers.push(observer);
        self
    }

    pub fn on_added<E, F>(&mut self, callback: F) -> &mut Self
    where
        E: Observed,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe::<E>(Arc::new(OnAdded(callback)))
    }

    pub fn on_updated<E, F>(&mut self, callback: F) -> &mut Self
    where
        E: Observed,
        F: Fn(&E, &E) + Send + Sync + 'static,
    {
        self.subscribe::<E>(Arc::new(OnUpdated(callback)))
    }

    pub fn on_removed<E, F>(&mut self, callback: F) -> &mut Self
    where
        E: Observed,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe::<E>(Arc::new(OnRemoved(callback)))
    }

    pub fn observer_count<E: Observed>(&self) -> usize {
        E::registry(self).len()
    }

    pub(crate) fn added<E: Observed>(&self, current: &E) {
        for observer in &E::registry(self).observers {
            observer.on_added(current);
        }
    }

    pub(crate) fn updated<E: Observed>(&self, previous: &E, current: &E) {
        for observer in &E::registry(self).observers {
            observer.on_updated(previous, current);
        }
    }

    pub(crate) fn removed<E: Observed>(&self, last: &E) {
        for observer in &E::registry(self).observers {
            observer.on_removed(last);
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("customers", &self.customers.len())
            .field("plans", &self.plans.len())
            .field("prices", &self.prices.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// Logs every change at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeLogger;

impl<E: MirrorEntity> MirrorObserver<E> for ChangeLogger {
    fn on_added(&self, current: &E) {
        tracing::info!(
            kind = %E::KIND,
            id = current.id(),
            provider_id = %current.provider_id(),
            "Mirror row added"
        );
    }

    fn on_updated(&self, _previous: &E, current: &E) {
        tracing::info!(
            kind = %E::KIND,
            id = current.id(),
            provider_id = %current.provider_id(),
            "Mirror row updated"
        );
    }

    fn on_removed(&self, last: &E) {
        tracing::info!(
            kind = %E::KIND,
            id = last.id(),
            provider_id = %last.provider_id(),
            "Mirror row removed"
        );
    }
}

impl EventBus {
    /// Registers [`ChangeLogger`] for all four entity types.
    pub fn with_change_logging(mut self) -> Self {
        let logger = Arc::new(ChangeLogger);
        self.subscribe::<Customer>(logger.clone())
            .subscribe::<Plan>(logger.clone())
            .subscribe::<Price>(logger.clone())
            .subscribe::<Subscription>(logger);
        self
    }
}
