//! HTTP surface.
//!
//! Successes are rendered as `{"success": true, "data": ...}`, failures as
//! `{"success": false, "code": ..., "message": ..., "retryable": ...}`.

pub mod handlers;

use axum::{
    async_trait,
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{error, warn};
use validator::Validate;

use crate::domain::aggregates::{CouponRejection, OrderError};
use crate::providers::ProviderError;
use crate::store::StoreError;
use crate::{CheckoutError, Storefront};

pub fn router(state: Storefront) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/cart/items", post(handlers::add_to_cart))
        .route("/api/v1/orders/:id", get(handlers::get_order))
        .route("/api/v1/orders/:id/items/:product_id", put(handlers::update_line).delete(handlers::remove_line))
        .route("/api/v1/orders/:id/coupon", post(handlers::apply_coupon))
        .route("/api/v1/orders/:id/payment-intent", post(handlers::create_payment_intent))
        .route("/api/v1/orders/:id/payment/confirm", post(handlers::confirm_payment))
        .route("/api/v1/orders/:id/cancel", post(handlers::cancel_order))
        .route("/api/v1/coupons/validate", post(handlers::validate_coupon))
        .route("/api/v1/admin/coupons", post(handlers::create_coupon))
        .route("/api/v1/admin/orders/:id/ship", post(handlers::ship_order))
        .route("/api/v1/admin/orders/:id/deliver", post(handlers::deliver_order))
        .route("/api/v1/admin/payments/:id/refund", post(handlers::refund_payment))
        .route("/api/v1/users/:id/notifications", get(handlers::list_notifications))
        .route("/api/v1/users/:user_id/notifications/:id/read", post(handlers::mark_notification_read))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> { Json(Self { success: true, data }) }
}

#[derive(Debug)]
pub struct ApiError(pub CheckoutError);

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self { Self(err) }
}

pub fn status_for(err: &CheckoutError) -> StatusCode {
    match err {
        CheckoutError::Validation(_) => StatusCode::BAD_REQUEST,
        CheckoutError::OrderNotFound(_)
        | CheckoutError::ProductNotFound(_)
        | CheckoutError::PaymentNotFound(_)
        | CheckoutError::IntentNotFound(_)
        | CheckoutError::NotificationNotFound(_)
        | CheckoutError::Order(OrderError::LineNotFound(_))
        | CheckoutError::Coupon(CouponRejection::NotFound) => StatusCode::NOT_FOUND,
        CheckoutError::Order(OrderError::Quantity(_) | OrderError::CurrencyMismatch { .. } | OrderError::BelowCouponMinimum { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        CheckoutError::Order(_)
        | CheckoutError::DuplicateCoupon(_)
        | CheckoutError::ProductUnavailable(_)
        | CheckoutError::Stock(_)
        | CheckoutError::AmountMismatch { .. }
        | CheckoutError::Storage(StoreError::Conflict(_) | StoreError::Duplicate(_)) => StatusCode::CONFLICT,
        CheckoutError::Coupon(_)
        | CheckoutError::CouponDefinition(_)
        | CheckoutError::Payment(_)
        | CheckoutError::PaymentDeclined(_)
        | CheckoutError::ProviderNotConfigured(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CheckoutError::Provider(ProviderError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        CheckoutError::Provider(_) => StatusCode::BAD_GATEWAY,
        CheckoutError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            warn!(code = self.0.code(), error = %self.0, "request rejected");
        }
        let body = json!({
            "success": false,
            "code": self.0.code(),
            "message": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

/// JSON body that is also checked with its `validator` rules.
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError(CheckoutError::Validation(rejection.body_text())))?;
        value.validate().map_err(|e| ApiError(CheckoutError::Validation(e.to_string())))?;
        Ok(Self(value))
    }
}
