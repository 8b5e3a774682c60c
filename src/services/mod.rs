//! Application services
pub mod coupons;
pub mod notifications;
pub mod orders;
pub mod payments;

use std::sync::Arc;

use crate::config::CheckoutSettings;
use crate::providers::ProviderRegistry;
use crate::store::CheckoutStore;

pub use coupons::{CouponEngine, CouponQuote};
pub use notifications::{notifications_for, NatsPush, NotificationEmitter, NullPush, PushChannel, PushError};
pub use orders::OrderWorkflow;
pub use payments::{ConfirmOutcome, PaymentOrchestrator};

/// The four checkout components wired to one store.
#[derive(Clone)]
pub struct Storefront {
    pub coupons: CouponEngine,
    pub orders: OrderWorkflow,
    pub payments: PaymentOrchestrator,
    pub notifications: NotificationEmitter,
}

impl Storefront {
    pub fn new(store: Arc<dyn CheckoutStore>, providers: ProviderRegistry, push: Arc<dyn PushChannel>, settings: CheckoutSettings) -> Self {
        let notifications = NotificationEmitter::new(store.clone(), push, settings.push_timeout);
        Self {
            coupons: CouponEngine::new(store.clone(), notifications.clone()),
            orders: OrderWorkflow::new(store.clone(), providers.clone(), notifications.clone(), settings.clone()),
            payments: PaymentOrchestrator::new(store, providers, notifications.clone(), settings),
            notifications,
        }
    }
}
