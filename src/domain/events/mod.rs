//! Domain events
use crate::domain::aggregates::order::{CancelActor, OrderStatus};
use crate::domain::value_objects::OrderNumber;
use rust_decimal::Decimal;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq)]
pub enum DomainEvent {
    Order(OrderEvent),
    Payment(PaymentEvent),
    Product(ProductEvent),
}

#[derive(Clone, Debug, PartialEq)]
pub enum OrderEvent {
    /// Checkout submitted: the cart became a placed order.
    Placed { order_id: Uuid, order_number: OrderNumber, user_id: Uuid, total: Decimal, currency: String },
    StatusChanged { order_id: Uuid, order_number: OrderNumber, user_id: Uuid, from: OrderStatus, to: OrderStatus },
    Cancelled { order_id: Uuid, order_number: OrderNumber, user_id: Uuid, actor: CancelActor, reason: Option<String> },
    CouponApplied { order_id: Uuid, code: String, discount: Decimal },
}

#[derive(Clone, Debug, PartialEq)]
pub enum PaymentEvent {
    Received { payment_id: Uuid, order_id: Uuid, order_number: OrderNumber, user_id: Uuid, amount: Decimal, currency: String },
    Refunded { payment_id: Uuid, order_id: Uuid, user_id: Uuid, amount: Decimal, currency: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProductEvent {
    LowStock { product_id: Uuid, sku: String, name: String, stock: i32, threshold: i32 },
}
