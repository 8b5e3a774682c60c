//! Product snapshot as seen by the checkout workflow

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;
use crate::domain::events::{DomainEvent, ProductEvent};
use crate::domain::value_objects::Money;

#[derive(Clone, Debug)]
pub struct Product {
    id: Uuid,
    sku: String,
    name: String,
    price: Money,
    stock: i32,
    active: bool,
    updated_at: DateTime<Utc>,
}

/// Stock before and after a movement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StockLevel {
    pub product_id: Uuid,
    pub sku: String,
    pub name: String,
    pub previous: i32,
    pub current: i32,
}

impl StockLevel {
    /// True only on the movement that takes stock from at/above `threshold` to below it.
    pub fn crossed_below(&self, threshold: i32) -> bool { self.previous >= threshold && self.current < threshold }

    pub fn low_stock_event(&self, threshold: i32) -> Option<DomainEvent> {
        self.crossed_below(threshold).then(|| DomainEvent::Product(ProductEvent::LowStock {
            product_id: self.product_id, sku: self.sku.clone(), name: self.name.clone(), stock: self.current, threshold,
        }))
    }
}

impl Product {
    pub fn create(sku: &str, name: impl Into<String>, price: Money, stock: i32) -> Self {
        Self {
            id: Uuid::now_v7(), sku: sku.trim().to_uppercase(), name: name.into(), price, stock: stock.max(0),
            active: true, updated_at: Utc::now(),
        }
    }

    pub fn restore(id: Uuid, sku: String, name: String, price: Money, stock: i32, active: bool, updated_at: DateTime<Utc>) -> Self {
        Self { id, sku, name, price, stock, active, updated_at }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn sku(&self) -> &str { &self.sku }
    pub fn name(&self) -> &str { &self.name }
    pub fn price(&self) -> &Money { &self.price }
    pub fn stock(&self) -> i32 { self.stock }
    pub fn is_active(&self) -> bool { self.active }
    pub fn is_in_stock(&self) -> bool { self.stock > 0 }
    pub fn can_supply(&self, quantity: u32) -> bool { i64::from(self.stock) >= i64::from(quantity) }

    pub fn update_price(&mut self, new_price: Money) {
        self.price = new_price;
        self.touch();
    }

    pub fn deactivate(&mut self) { self.active = false; self.touch(); }

    pub fn remove_stock(&mut self, quantity: u32) -> Result<StockLevel, ProductError> {
        if !self.can_supply(quantity) {
            return Err(ProductError::InsufficientStock { product_id: self.id, available: self.stock, requested: quantity });
        }
        let previous = self.stock;
        self.stock -= quantity as i32;
        self.touch();
        Ok(self.level(previous))
    }

    pub fn add_stock(&mut self, quantity: u32) -> StockLevel {
        let previous = self.stock;
        self.stock = self.stock.saturating_add(quantity as i32);
        self.touch();
        self.level(previous)
    }

    fn level(&self, previous: i32) -> StockLevel {
        StockLevel { product_id: self.id, sku: self.sku.clone(), name: self.name.clone(), previous, current: self.stock }
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProductError {
    #[error("insufficient stock for product {product_id}: {available} available, {requested} requested")]
    InsufficientStock { product_id: Uuid, available: i32, requested: u32 },
}
