use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::{ApiError, ApiResponse, ValidatedJson};
use crate::domain::aggregates::{
    CancelActor, Cancellation, Coupon, DiscountKind, LineItem, NewCoupon, Notification, Order, OrderStatus, Payment, PaymentIntent,
    ProviderKind,
};
use crate::services::{ConfirmOutcome, CouponQuote};
use crate::{CheckoutError, Storefront};

type ApiResult<T> = Result<T, ApiError>;
type Reply<T> = Json<ApiResponse<T>>;

// =============================================================================
// Views
// =============================================================================

#[derive(Debug, Serialize)]
pub struct OrderView {
    pub id: Uuid,
    pub number: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub currency: String,
    pub lines: Vec<LineItem>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub coupon_code: Option<String>,
    pub cancellation: Option<Cancellation>,
    pub created_at: DateTime<Utc>,
    pub placed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Order> for OrderView {
    fn from(o: &Order) -> Self {
        Self {
            id: o.id(), number: o.number().to_string(), user_id: o.user_id(), status: o.status(), currency: o.currency().to_string(),
            lines: o.lines().to_vec(), subtotal: o.subtotal().amount(), discount: o.discount().amount(), total: o.total().amount(),
            coupon_code: o.coupon().map(|c| c.code.clone()), cancellation: o.cancellation().cloned(),
            created_at: o.created_at(), placed_at: o.placed_at(), updated_at: o.updated_at(),
        }
    }
}

fn view(order: Order) -> Reply<OrderView> { ApiResponse::ok(OrderView::from(&order)) }

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct AddToCartRequest {
    pub user_id: Uuid,
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 999))]
    pub quantity: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateLineRequest {
    #[validate(range(max = 999))]
    pub quantity: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyCouponRequest {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateIntentRequest {
    pub provider: ProviderKind,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConfirmPaymentRequest {
    pub intent_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CancelOrderRequest {
    pub actor: CancelActor,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
    pub order_amount: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCouponRequest {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
    pub kind: DiscountKind,
    pub value: Decimal,
    pub minimum_amount: Option<Decimal>,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    pub amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub unread: Option<bool>,
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy", "service": "boutique-checkout"}))
}

pub async fn add_to_cart(State(s): State<Storefront>, ValidatedJson(r): ValidatedJson<AddToCartRequest>) -> ApiResult<(StatusCode, Reply<OrderView>)> {
    let order = s.orders.add_to_cart(r.user_id, r.product_id, r.quantity).await?;
    Ok((StatusCode::CREATED, view(order)))
}

pub async fn get_order(State(s): State<Storefront>, Path(id): Path<Uuid>) -> ApiResult<Reply<OrderView>> {
    Ok(view(s.orders.get(id).await?))
}

pub async fn update_line(
    State(s): State<Storefront>,
    Path((id, product_id)): Path<(Uuid, Uuid)>,
    ValidatedJson(r): ValidatedJson<UpdateLineRequest>,
) -> ApiResult<Reply<OrderView>> {
    Ok(view(s.orders.update_line(id, product_id, r.quantity).await?))
}

pub async fn remove_line(State(s): State<Storefront>, Path((id, product_id)): Path<(Uuid, Uuid)>) -> ApiResult<Reply<OrderView>> {
    Ok(view(s.orders.remove_line(id, product_id).await?))
}

pub async fn apply_coupon(State(s): State<Storefront>, Path(id): Path<Uuid>, ValidatedJson(r): ValidatedJson<ApplyCouponRequest>) -> ApiResult<Reply<OrderView>> {
    Ok(view(s.coupons.apply(id, &r.code).await?))
}

pub async fn create_payment_intent(
    State(s): State<Storefront>,
    Path(id): Path<Uuid>,
    ValidatedJson(r): ValidatedJson<CreateIntentRequest>,
) -> ApiResult<(StatusCode, Reply<PaymentIntent>)> {
    let intent = s.payments.create_intent(id, r.provider).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(intent)))
}

pub async fn confirm_payment(
    State(s): State<Storefront>,
    Path(id): Path<Uuid>,
    ValidatedJson(r): ValidatedJson<ConfirmPaymentRequest>,
) -> ApiResult<(StatusCode, Reply<ConfirmOutcome>)> {
    let outcome = s.payments.confirm(id, r.intent_id).await?;
    let status = match outcome {
        ConfirmOutcome::Paid { .. } => StatusCode::OK,
        ConfirmOutcome::Pending { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, ApiResponse::ok(outcome)))
}

pub async fn cancel_order(State(s): State<Storefront>, Path(id): Path<Uuid>, ValidatedJson(r): ValidatedJson<CancelOrderRequest>) -> ApiResult<Reply<OrderView>> {
    let reason = r.reason.map(|text| text.trim().to_string()).filter(|text| !text.is_empty());
    Ok(view(s.orders.cancel(id, r.actor, reason).await?))
}

pub async fn validate_coupon(State(s): State<Storefront>, ValidatedJson(r): ValidatedJson<ValidateCouponRequest>) -> ApiResult<Reply<CouponQuote>> {
    if r.order_amount < Decimal::ZERO {
        return Err(CheckoutError::Validation("order_amount cannot be negative".into()).into());
    }
    Ok(ApiResponse::ok(s.coupons.validate(&r.code, r.order_amount).await?))
}

pub async fn create_coupon(State(s): State<Storefront>, ValidatedJson(r): ValidatedJson<CreateCouponRequest>) -> ApiResult<(StatusCode, Reply<Coupon>)> {
    let coupon = s
        .coupons
        .create(NewCoupon {
            code: r.code, kind: r.kind, value: r.value, minimum_amount: r.minimum_amount, usage_limit: r.usage_limit,
            starts_at: r.starts_at, expires_at: r.expires_at,
        })
        .await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(coupon)))
}

pub async fn ship_order(State(s): State<Storefront>, Path(id): Path<Uuid>) -> ApiResult<Reply<OrderView>> {
    Ok(view(s.orders.ship(id).await?))
}

pub async fn deliver_order(State(s): State<Storefront>, Path(id): Path<Uuid>) -> ApiResult<Reply<OrderView>> {
    Ok(view(s.orders.deliver(id).await?))
}

pub async fn refund_payment(State(s): State<Storefront>, Path(id): Path<Uuid>, ValidatedJson(r): ValidatedJson<RefundRequest>) -> ApiResult<Reply<Payment>> {
    Ok(ApiResponse::ok(s.payments.refund(id, r.amount).await?))
}

pub async fn list_notifications(
    State(s): State<Storefront>,
    Path(user_id): Path<Uuid>,
    Query(q): Query<NotificationQuery>,
) -> ApiResult<Reply<Vec<Notification>>> {
    Ok(ApiResponse::ok(s.notifications.list(user_id, q.unread.unwrap_or(false)).await?))
}

pub async fn mark_notification_read(State(s): State<Storefront>, Path((user_id, id)): Path<(Uuid, Uuid)>) -> ApiResult<Reply<Notification>> {
    Ok(ApiResponse::ok(s.notifications.mark_read(user_id, id).await?))
}
