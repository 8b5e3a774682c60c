//! Aggregates module
pub mod coupon;
pub mod notification;
pub mod order;
pub mod payment;
pub mod product;

pub use coupon::{Coupon, CouponDefinitionError, CouponRejection, DiscountKind, NewCoupon};
pub use notification::{Notification, NotificationKind};
pub use order::{AppliedCoupon, CancelActor, CancelEffects, Cancellation, LineItem, Order, OrderError, OrderParts, OrderStatus};
pub use payment::{IntentState, Payment, PaymentError, PaymentIntent, PaymentStatus, ProviderKind};
pub use product::{Product, ProductError, StockLevel};
