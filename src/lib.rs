//! Boutique checkout service
//!
//! Payment and order workflow for a French storefront.
//!
//! ## Components
//! - Coupon engine: validation, discount computation, atomic usage claims
//! - Payment orchestrator: card (Stripe-style) and wallet (PayPal-style) providers
//! - Order state machine: `panier -> en_attente -> confirmee -> expediee -> livree`, plus `annulee`
//! - Notification emitter: persisted inbox entries and best-effort live pushes

pub mod api;
pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod store;

use thiserror::Error;
use uuid::Uuid;

use domain::aggregates::{CouponDefinitionError, CouponRejection, OrderError, PaymentError, ProductError, ProviderKind};
use domain::value_objects::Money;
use providers::ProviderError;
use store::StoreError;

pub use config::{AppConfig, CheckoutSettings};
pub use services::Storefront;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum CheckoutError {
    #[error("{0}")]
    Validation(String),

    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("product {0} not found")]
    ProductNotFound(Uuid),

    #[error("payment {0} not found")]
    PaymentNotFound(Uuid),

    #[error("payment intent {0} not found for this order")]
    IntentNotFound(Uuid),

    #[error("notification {0} not found")]
    NotificationNotFound(Uuid),

    #[error(transparent)]
    Coupon(#[from] CouponRejection),

    #[error(transparent)]
    CouponDefinition(#[from] CouponDefinitionError),

    #[error("coupon code {0} already exists")]
    DuplicateCoupon(String),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("product {0} is not available")]
    ProductUnavailable(Uuid),

    #[error(transparent)]
    Stock(#[from] ProductError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error("payment declined: {0}")]
    PaymentDeclined(String),

    #[error("payment provider {0} is not configured")]
    ProviderNotConfigured(ProviderKind),

    #[error("provider captured {captured} but the order total is {expected}")]
    AmountMismatch { captured: Money, expected: Money },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl CheckoutError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::OrderNotFound(_) => "order_not_found",
            Self::ProductNotFound(_) => "product_not_found",
            Self::PaymentNotFound(_) => "payment_not_found",
            Self::IntentNotFound(_) => "intent_not_found",
            Self::NotificationNotFound(_) => "notification_not_found",
            Self::Coupon(rejection) => rejection.code(),
            Self::CouponDefinition(_) => "invalid_coupon_definition",
            Self::DuplicateCoupon(_) => "coupon_code_taken",
            Self::Order(err) => match err {
                OrderError::NotInCart(_) => "order_not_in_cart",
                OrderError::EmptyOrder => "empty_order",
                OrderError::LineNotFound(_) => "line_not_found",
                OrderError::InvalidTransition { .. } => "invalid_transition",
                OrderError::NotCancellable(_) => "not_cancellable",
                OrderError::NotPayable(_) => "order_not_payable",
                OrderError::NothingToPay => "nothing_to_pay",
                OrderError::CouponAlreadyApplied => "coupon_already_applied",
                OrderError::CouponNotApplicable(_) => "coupon_not_applicable",
                OrderError::BelowCouponMinimum { .. } => "coupon_below_minimum",
                OrderError::CurrencyMismatch { .. } => "currency_mismatch",
                OrderError::Quantity(_) => "invalid_quantity",
            },
            Self::ProductUnavailable(_) => "product_unavailable",
            Self::Stock(_) => "insufficient_stock",
            Self::Payment(err) => match err {
                PaymentError::NotRefundable(_) => "payment_not_refundable",
                PaymentError::NonPositiveRefund => "invalid_refund_amount",
                PaymentError::ExceedsBalance { .. } => "refund_exceeds_balance",
            },
            Self::PaymentDeclined(_) => "payment_declined",
            Self::ProviderNotConfigured(_) => "provider_not_configured",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::Provider(ProviderError::Timeout { .. }) => "provider_timeout",
            Self::Provider(ProviderError::Auth { .. }) => "provider_auth_failed",
            Self::Provider(_) => "provider_error",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(err) => err.is_retryable(),
            Self::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CheckoutError>;

#[cfg(test)]
mod tests {
    use super::*;
    use domain::aggregates::OrderStatus;

    #[test]
    fn test_codes_follow_the_rejection() {
        assert_eq!(CheckoutError::from(CouponRejection::LimitReached).code(), "coupon_limit_reached");
        assert_eq!(CheckoutError::from(OrderError::NotCancellable(OrderStatus::Livree)).code(), "not_cancellable");
    }

    #[test]
    fn test_only_transient_failures_are_retryable() {
        let timeout = CheckoutError::from(ProviderError::Timeout { provider: ProviderKind::Stripe });
        assert!(timeout.is_retryable());
        assert_eq!(timeout.code(), "provider_timeout");
        let declined = CheckoutError::Provider(ProviderError::Api {
            provider: ProviderKind::Stripe, status: 402, code: Some("card_declined".into()), message: "declined".into(),
        });
        assert!(!declined.is_retryable());
        assert!(!CheckoutError::PaymentDeclined("card declined".into()).is_retryable());
    }
}
