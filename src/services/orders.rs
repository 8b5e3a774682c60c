//! Order workflow: cart lines, fulfillment and cancellation

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::notifications::NotificationEmitter;
use crate::config::CheckoutSettings;
use crate::domain::aggregates::{CancelActor, IntentState, Order, OrderError, Product, ProductError};
use crate::domain::value_objects::Quantity;
use crate::providers::ProviderRegistry;
use crate::store::{CheckoutStore, StoreError};
use crate::{CheckoutError, Result};

const NUMBER_ATTEMPTS: u32 = 5;

/// Store a cart that was never saved, drawing a new number while its number is taken.
async fn insert_cart(store: &dyn CheckoutStore, cart: &mut Order) -> Result<()> {
    let mut attempt = 1;
    loop {
        match store.save_order(cart).await {
            Err(StoreError::Duplicate(_)) if attempt < NUMBER_ATTEMPTS => {
                warn!(number = %cart.number(), attempt, "order number taken, drawing another");
                cart.renumber(Utc::now());
                attempt += 1;
            }
            other => return Ok(other?),
        }
    }
}

#[derive(Clone)]
pub struct OrderWorkflow {
    store: Arc<dyn CheckoutStore>,
    providers: ProviderRegistry,
    notifier: NotificationEmitter,
    settings: CheckoutSettings,
}

impl OrderWorkflow {
    pub fn new(store: Arc<dyn CheckoutStore>, providers: ProviderRegistry, notifier: NotificationEmitter, settings: CheckoutSettings) -> Self {
        Self { store, providers, notifier, settings }
    }

    pub async fn get(&self, order_id: Uuid) -> Result<Order> {
        self.store.load_order(order_id).await?.ok_or(CheckoutError::OrderNotFound(order_id))
    }

    async fn available_product(&self, product_id: Uuid) -> Result<Product> {
        let product = self.store.find_product(product_id).await?.ok_or(CheckoutError::ProductNotFound(product_id))?;
        if !product.is_active() {
            return Err(CheckoutError::ProductUnavailable(product_id));
        }
        Ok(product)
    }

    fn ensure_supply(product: &Product, quantity: u32) -> Result<()> {
        if !product.can_supply(quantity) {
            return Err(ProductError::InsufficientStock {
                product_id: product.id(),
                available: product.stock(),
                requested: quantity,
            }
            .into());
        }
        Ok(())
    }

    /// Add to the user's open cart, opening one when needed.
    #[instrument(skip_all, fields(user_id = %user_id, product_id = %product_id))]
    pub async fn add_to_cart(&self, user_id: Uuid, product_id: Uuid, quantity: u32) -> Result<Order> {
        let quantity = Quantity::new(quantity).map_err(OrderError::from)?;
        let product = self.available_product(product_id).await?;
        let mut order = match self.store.find_cart(user_id).await? {
            Some(cart) => cart,
            None => Order::open_cart(user_id, &self.settings.currency, Utc::now()),
        };
        let in_cart = order.lines().iter().find(|l| l.product_id == product_id).map_or(0, |l| l.quantity);
        Self::ensure_supply(&product, in_cart + quantity.value())?;
        order.add_line(&product, quantity)?;
        if order.version() == 0 {
            insert_cart(self.store.as_ref(), &mut order).await?;
        } else {
            self.store.save_order(&order).await?;
        }
        Ok(order)
    }

    /// Set a cart line's quantity; zero removes it.
    pub async fn update_line(&self, order_id: Uuid, product_id: Uuid, quantity: u32) -> Result<Order> {
        let mut order = self.get(order_id).await?;
        if quantity > 0 {
            let product = self.available_product(product_id).await?;
            Self::ensure_supply(&product, quantity)?;
        }
        order.set_line_quantity(product_id, quantity)?;
        self.store.save_order(&order).await?;
        Ok(order)
    }

    pub async fn remove_line(&self, order_id: Uuid, product_id: Uuid) -> Result<Order> {
        let mut order = self.get(order_id).await?;
        order.remove_line(product_id)?;
        self.store.save_order(&order).await?;
        Ok(order)
    }

    pub async fn ship(&self, order_id: Uuid) -> Result<Order> {
        let mut order = self.get(order_id).await?;
        order.ship()?;
        self.commit(order).await
    }

    pub async fn deliver(&self, order_id: Uuid) -> Result<Order> {
        let mut order = self.get(order_id).await?;
        order.deliver()?;
        self.commit(order).await
    }

    async fn commit(&self, mut order: Order) -> Result<Order> {
        let events = order.take_events();
        self.store.save_order(&order).await?;
        info!(order_id = %order.id(), status = %order.status(), "order status changed");
        self.notifier.emit(events).await;
        Ok(order)
    }

    /// Cancel a pending or confirmed order.
    ///
    /// Releases the coupon use and restocks confirmed lines in the same unit of
    /// work; then abandons any open provider intent on a best-effort basis.
    #[instrument(skip_all, fields(order_id = %order_id, actor = actor.as_str()))]
    pub async fn cancel(&self, order_id: Uuid, actor: CancelActor, reason: Option<String>) -> Result<Order> {
        let mut order = self.get(order_id).await?;
        let effects = order.cancel(actor, reason, Utc::now())?;
        let events = order.take_events();
        self.store.cancel_order(&order, &effects).await?;
        info!(
            coupon_released = effects.release_coupon.is_some(),
            restocked_lines = effects.restock.len(),
            "order cancelled"
        );
        self.abandon_open_intents(order_id).await;
        self.notifier.emit(events).await;
        Ok(order)
    }

    async fn abandon_open_intents(&self, order_id: Uuid) {
        let intents = match self.store.intents_for_order(order_id).await {
            Ok(intents) => intents,
            Err(e) => {
                warn!(error = %e, "could not load payment intents of cancelled order");
                return;
            }
        };
        for mut intent in intents.into_iter().filter(|i| i.is_open()) {
            let Some(provider) = self.providers.get(intent.provider) else {
                warn!(intent_id = %intent.id, provider = %intent.provider, "provider not configured, intent left open");
                continue;
            };
            if let Err(e) = provider.cancel(&intent.provider_ref).await {
                warn!(intent_id = %intent.id, error = %e, "provider refused to cancel intent");
                continue;
            }
            intent.state = IntentState::Canceled;
            intent.updated_at = Utc::now();
            if let Err(e) = self.store.save_intent(&intent).await {
                warn!(intent_id = %intent.id, error = %e, "could not mark intent canceled");
            }
        }
    }
}
