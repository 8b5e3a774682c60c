mod support;

use boutique_checkout::domain::aggregates::{
    CancelActor, DiscountKind, IntentState, NotificationKind, OrderStatus, Payment, PaymentStatus, ProviderKind,
};
use boutique_checkout::domain::value_objects::Money;
use boutique_checkout::providers::ProviderCapture;
use boutique_checkout::services::ConfirmOutcome;
use boutique_checkout::store::PaymentRepository;
use rust_decimal_macros::dec;
use std::sync::Arc;
use support::{coupon, FailingPush, HangingPush, Shop};
use uuid::Uuid;

async fn pay(shop: &Shop, order_id: Uuid) -> Payment {
    let intent = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    match shop.front.payments.confirm(order_id, intent.id).await.unwrap() {
        ConfirmOutcome::Paid { payment } => payment,
        other => panic!("expected a payment, got {other:?}"),
    }
}

fn kinds_for(shop_notes: &[boutique_checkout::domain::aggregates::Notification], user: Uuid) -> Vec<NotificationKind> {
    shop_notes.iter().filter(|n| n.user_id == user).map(|n| n.kind).collect()
}

#[tokio::test]
async fn test_checkout_with_coupon_through_delivery() {
    let shop = Shop::open().await;
    let order_id = shop.cart(2).await;
    let order = shop.front.coupons.apply(order_id, " summer10 ").await.unwrap();
    assert_eq!(order.subtotal().amount(), dec!(100.00));
    assert_eq!(order.discount().amount(), dec!(10.00));
    assert_eq!(order.total().amount(), dec!(90.00));

    let intent = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    assert_eq!((intent.amount, intent.currency.as_str()), (dec!(90.00), "EUR"));
    assert_eq!(shop.front.orders.get(order_id).await.unwrap().status(), OrderStatus::EnAttente);

    let ConfirmOutcome::Paid { payment } = shop.front.payments.confirm(order_id, intent.id).await.unwrap() else {
        panic!("payment should be captured");
    };
    assert_eq!(payment.amount, dec!(90.00));
    assert_eq!(payment.status, PaymentStatus::Paye);
    assert_eq!(shop.front.orders.get(order_id).await.unwrap().status(), OrderStatus::Confirmee);
    assert_eq!(shop.stock_of(shop.widget.id()).await, 18);
    assert_eq!(shop.used_count(shop.summer.id).await, 1);

    shop.front.orders.ship(order_id).await.unwrap();
    let delivered = shop.front.orders.deliver(order_id).await.unwrap();
    assert_eq!(delivered.status(), OrderStatus::Livree);

    let notes = shop.store.notifications().await;
    assert_eq!(
        kinds_for(&notes, shop.customer),
        vec![
            NotificationKind::OrderCreated,
            NotificationKind::OrderStatusChanged,
            NotificationKind::PaymentReceived,
            NotificationKind::OrderStatusChanged,
            NotificationKind::OrderStatusChanged,
        ]
    );
    assert_eq!(kinds_for(&notes, shop.admin), vec![NotificationKind::NewOrder]);
}

#[tokio::test]
async fn test_coupon_below_minimum_is_rejected() {
    let shop = Shop::open().await;
    let quote = shop.front.coupons.validate("SUMMER10", dec!(100)).await.unwrap();
    assert_eq!(quote.discount, dec!(10.00));
    let err = shop.front.coupons.validate("SUMMER10", dec!(40)).await.unwrap_err();
    assert_eq!(err.code(), "coupon_below_minimum");
    assert_eq!(shop.front.coupons.validate("NOPE", dec!(40)).await.unwrap_err().code(), "coupon_not_found");
}

#[tokio::test]
async fn test_second_coupon_is_refused() {
    let shop = Shop::open().await;
    let other = coupon("BIENVENUE", DiscountKind::Fixed, dec!(5), None, None);
    shop.store.add_coupon(other.clone()).await;
    let order_id = shop.cart(2).await;
    shop.front.coupons.apply(order_id, "SUMMER10").await.unwrap();
    let err = shop.front.coupons.apply(order_id, "BIENVENUE").await.unwrap_err();
    assert_eq!(err.code(), "coupon_already_applied");
    assert_eq!(shop.used_count(other.id).await, 0);
}

#[tokio::test]
async fn test_cancelling_pending_order_releases_coupon_and_intent() {
    let shop = Shop::open().await;
    let order_id = shop.cart(2).await;
    shop.front.coupons.apply(order_id, "SUMMER10").await.unwrap();
    let intent = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    assert_eq!(shop.used_count(shop.summer.id).await, 1);

    let order = shop.front.orders.cancel(order_id, CancelActor::Client, None).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Annulee);
    assert_eq!(shop.used_count(shop.summer.id).await, 0);
    assert_eq!(shop.stock_of(shop.widget.id()).await, 20);
    assert_eq!(shop.card.cancel_calls(), 1);
    let stored = shop.store.find_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(stored.state, IntentState::Canceled);

    let err = shop.front.payments.confirm(order_id, intent.id).await.unwrap_err();
    assert_eq!(err.code(), "order_not_payable");
}

#[tokio::test]
async fn test_cancelling_confirmed_order_restocks() {
    let shop = Shop::open().await;
    let order_id = shop.cart(3).await;
    pay(&shop, order_id).await;
    assert_eq!(shop.stock_of(shop.widget.id()).await, 17);

    let order = shop.front.orders.cancel(order_id, CancelActor::Admin, Some("rupture fournisseur".into())).await.unwrap();
    assert_eq!(order.cancellation().map(|c| c.actor), Some(CancelActor::Admin));
    assert_eq!(shop.stock_of(shop.widget.id()).await, 20);
    let notes = shop.store.notifications().await;
    let cancelled = notes.iter().find(|n| n.kind == NotificationKind::OrderCancelled).unwrap();
    assert_eq!(cancelled.user_id, shop.customer);
    assert!(cancelled.message.contains("rupture fournisseur"));
}

#[tokio::test]
async fn test_delivered_order_cannot_be_cancelled() {
    let shop = Shop::open().await;
    let order_id = shop.cart(1).await;
    pay(&shop, order_id).await;
    shop.front.orders.ship(order_id).await.unwrap();
    shop.front.orders.deliver(order_id).await.unwrap();
    let err = shop.front.orders.cancel(order_id, CancelActor::Client, None).await.unwrap_err();
    assert_eq!(err.code(), "not_cancellable");
    assert_eq!(shop.front.orders.ship(order_id).await.unwrap_err().code(), "invalid_transition");
}

#[tokio::test]
async fn test_cart_cannot_be_cancelled_or_shipped() {
    let shop = Shop::open().await;
    let order_id = shop.cart(1).await;
    assert_eq!(shop.front.orders.cancel(order_id, CancelActor::Client, None).await.unwrap_err().code(), "not_cancellable");
    assert_eq!(shop.front.orders.ship(order_id).await.unwrap_err().code(), "invalid_transition");
}

#[tokio::test]
async fn test_confirm_is_idempotent() {
    let shop = Shop::open().await;
    let order_id = shop.cart(2).await;
    let intent = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    let first = shop.front.payments.confirm(order_id, intent.id).await.unwrap();
    let second = shop.front.payments.confirm(order_id, intent.id).await.unwrap();
    let (ConfirmOutcome::Paid { payment: a }, ConfirmOutcome::Paid { payment: b }) = (first, second) else {
        panic!("both confirmations should report the payment");
    };
    assert_eq!(a.id, b.id);
    assert_eq!(shop.stock_of(shop.widget.id()).await, 18);
    let received = shop.store.notifications().await.into_iter().filter(|n| n.kind == NotificationKind::PaymentReceived).count();
    assert_eq!(received, 1);
}

#[tokio::test]
async fn test_declined_payment_keeps_order_pending() {
    let shop = Shop::open().await;
    let order_id = shop.cart(1).await;
    let intent = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    shop.card.script(Ok(ProviderCapture::failed("Votre carte a été refusée.")));

    let err = shop.front.payments.confirm(order_id, intent.id).await.unwrap_err();
    assert_eq!(err.code(), "payment_declined");
    assert!(err.to_string().contains("refusée"));
    assert_eq!(shop.front.orders.get(order_id).await.unwrap().status(), OrderStatus::EnAttente);
    assert_eq!(shop.store.find_intent(intent.id).await.unwrap().unwrap().state, IntentState::Failed);
    assert_eq!(shop.stock_of(shop.widget.id()).await, 20);

    let retry = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    assert_ne!(retry.id, intent.id);
    assert_eq!(shop.card.cancel_calls(), 0);
    let keys = shop.card.idempotency_keys.lock().unwrap().clone();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
    assert!(matches!(shop.front.payments.confirm(order_id, retry.id).await.unwrap(), ConfirmOutcome::Paid { .. }));
}

#[tokio::test]
async fn test_unsettled_intent_reports_pending() {
    let shop = Shop::open().await;
    let order_id = shop.cart(1).await;
    let intent = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    shop.card.script(Ok(ProviderCapture::pending(IntentState::Processing)));

    let outcome = shop.front.payments.confirm(order_id, intent.id).await.unwrap();
    assert!(matches!(outcome, ConfirmOutcome::Pending { state: IntentState::Processing }));
    assert_eq!(shop.front.orders.get(order_id).await.unwrap().status(), OrderStatus::EnAttente);
    assert_eq!(shop.store.find_intent(intent.id).await.unwrap().unwrap().state, IntentState::Processing);
}

#[tokio::test]
async fn test_short_capture_is_not_recorded() {
    let shop = Shop::open().await;
    let order_id = shop.cart(1).await;
    let intent = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    shop.card.script(Ok(ProviderCapture {
        state: IntentState::Succeeded,
        capture_ref: Some("ch_short".into()),
        amount: Some(Money::eur(dec!(10.00))),
        failure_reason: None,
        metadata: serde_json::Value::Null,
    }));

    let err = shop.front.payments.confirm(order_id, intent.id).await.unwrap_err();
    assert_eq!(err.code(), "amount_mismatch");
    assert_eq!(shop.front.orders.get(order_id).await.unwrap().status(), OrderStatus::EnAttente);
    assert!(shop.store.find_payment_by_intent(intent.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_intent_for_other_order_is_not_found() {
    let shop = Shop::open().await;
    let order_id = shop.cart(1).await;
    let intent = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    let err = shop.front.payments.confirm(Uuid::now_v7(), intent.id).await.unwrap_err();
    assert_eq!(err.code(), "intent_not_found");
}

#[tokio::test]
async fn test_open_intent_is_reused_until_total_changes() {
    let shop = Shop::open().await;
    let order_id = shop.cart(2).await;
    let first = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    let again = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(shop.card.created(), 1);

    shop.front.coupons.apply(order_id, "SUMMER10").await.unwrap();
    let replaced = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    assert_ne!(replaced.id, first.id);
    assert_eq!(replaced.amount, dec!(90.00));
    assert_eq!(shop.card.cancel_calls(), 1);
    assert_eq!(shop.store.find_intent(first.id).await.unwrap().unwrap().state, IntentState::Canceled);

    let placed = shop.store.notifications().await.into_iter().filter(|n| n.kind == NotificationKind::OrderCreated).count();
    assert_eq!(placed, 1);
}

#[tokio::test]
async fn test_unconfigured_provider_is_refused() {
    let shop = Shop::open().await;
    let order_id = shop.cart(1).await;
    let err = shop.front.payments.create_intent(order_id, ProviderKind::Paypal).await.unwrap_err();
    assert_eq!(err.code(), "provider_not_configured");
    assert_eq!(shop.front.orders.get(order_id).await.unwrap().status(), OrderStatus::Panier);
}

#[tokio::test]
async fn test_fully_discounted_order_has_nothing_to_pay() {
    let shop = Shop::open().await;
    shop.store.add_coupon(coupon("OFFERT", DiscountKind::Fixed, dec!(500), None, None)).await;
    let order_id = shop.cart(2).await;
    let order = shop.front.coupons.apply(order_id, "OFFERT").await.unwrap();
    assert!(order.total().is_zero());
    let err = shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap_err();
    assert_eq!(err.code(), "nothing_to_pay");
    assert_eq!(shop.card.created(), 0);
}

#[tokio::test]
async fn test_partial_then_full_refund_releases_coupon() {
    let shop = Shop::open().await;
    let order_id = shop.cart(2).await;
    shop.front.coupons.apply(order_id, "SUMMER10").await.unwrap();
    let payment = pay(&shop, order_id).await;

    let partial = shop.front.payments.refund(payment.id, Some(dec!(30))).await.unwrap();
    assert_eq!(partial.refunded_amount, dec!(30));
    assert_eq!(partial.status, PaymentStatus::Rembourse);
    assert_eq!(shop.used_count(shop.summer.id).await, 1);

    let full = shop.front.payments.refund(payment.id, None).await.unwrap();
    assert_eq!(full.refunded_amount, dec!(90.00));
    assert!(full.is_fully_refunded());
    assert_eq!(full.metadata["refunds"].as_array().map(Vec::len), Some(2));
    assert_eq!(shop.used_count(shop.summer.id).await, 0);

    let refunds = shop.card.refunds.lock().unwrap().clone();
    assert_eq!(refunds[1].1, Money::eur(dec!(60.00)));
    assert!(refunds.iter().all(|(capture, _)| capture == &payment.reference));

    let err = shop.front.payments.refund(payment.id, Some(dec!(1))).await.unwrap_err();
    assert_eq!(err.code(), "refund_exceeds_balance");
    assert_eq!(shop.front.orders.get(order_id).await.unwrap().status(), OrderStatus::Confirmee);
}

#[tokio::test]
async fn test_refund_of_unknown_payment() {
    let shop = Shop::open().await;
    let err = shop.front.payments.refund(Uuid::now_v7(), None).await.unwrap_err();
    assert_eq!(err.code(), "payment_not_found");
}

#[tokio::test]
async fn test_push_failure_does_not_fail_payment() {
    let shop = Shop::with_push(Arc::new(FailingPush)).await;
    let order_id = shop.cart(1).await;
    let payment = pay(&shop, order_id).await;
    assert_eq!(payment.amount, dec!(50.00));
    let stored = shop.front.notifications.list(shop.customer, false).await.unwrap();
    assert_eq!(stored.len(), 3);
}

#[tokio::test]
async fn test_stalled_push_times_out() {
    let shop = Shop::with_push(Arc::new(HangingPush)).await;
    let order_id = shop.cart(1).await;
    let paid = tokio::time::timeout(std::time::Duration::from_secs(10), pay(&shop, order_id)).await;
    assert!(paid.is_ok());
}

#[tokio::test]
async fn test_low_stock_alerts_admins_once() {
    let shop = Shop::open().await;
    let kettle = shop.product("KET-9", dec!(30), 6).await;
    let order_id = shop.front.orders.add_to_cart(shop.customer, kettle.id(), 2).await.unwrap().id();
    pay(&shop, order_id).await;
    assert_eq!(shop.stock_of(kettle.id()).await, 4);

    let other = Uuid::now_v7();
    let second = shop.front.orders.add_to_cart(other, kettle.id(), 1).await.unwrap().id();
    pay(&shop, second).await;

    let alerts: Vec<_> = shop.store.notifications().await.into_iter().filter(|n| n.kind == NotificationKind::LowStock).collect();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].user_id, shop.admin);
    assert_eq!(alerts[0].data["stock"], 4);
}

#[tokio::test]
async fn test_cart_respects_stock_and_availability() {
    let shop = Shop::open().await;
    let err = shop.front.orders.add_to_cart(shop.customer, shop.widget.id(), 21).await.unwrap_err();
    assert_eq!(err.code(), "insufficient_stock");

    shop.front.orders.add_to_cart(shop.customer, shop.widget.id(), 15).await.unwrap();
    let err = shop.front.orders.add_to_cart(shop.customer, shop.widget.id(), 6).await.unwrap_err();
    assert_eq!(err.code(), "insufficient_stock");

    let mut retired = shop.product("OLD-1", dec!(12), 10).await;
    retired.deactivate();
    shop.store.add_product(retired.clone()).await;
    let err = shop.front.orders.add_to_cart(shop.customer, retired.id(), 1).await.unwrap_err();
    assert_eq!(err.code(), "product_unavailable");

    let err = shop.front.orders.add_to_cart(shop.customer, Uuid::now_v7(), 1).await.unwrap_err();
    assert_eq!(err.code(), "product_not_found");
}

#[tokio::test]
async fn test_cart_lines_can_be_edited_until_checkout() {
    let shop = Shop::open().await;
    let cup = shop.product("CUP-2", dec!(8.50), 50).await;
    let order_id = shop.cart(1).await;
    let order = shop.front.orders.add_to_cart(shop.customer, cup.id(), 2).await.unwrap();
    assert_eq!(order.id(), order_id);
    assert_eq!(order.subtotal().amount(), dec!(67.00));

    let order = shop.front.orders.update_line(order_id, cup.id(), 4).await.unwrap();
    assert_eq!(order.subtotal().amount(), dec!(84.00));
    let order = shop.front.orders.update_line(order_id, cup.id(), 0).await.unwrap();
    assert_eq!(order.lines().len(), 1);

    shop.front.payments.create_intent(order_id, ProviderKind::Stripe).await.unwrap();
    let err = shop.front.orders.remove_line(order_id, shop.widget.id()).await.unwrap_err();
    assert_eq!(err.code(), "order_not_in_cart");

    let fresh = shop.front.orders.add_to_cart(shop.customer, cup.id(), 1).await.unwrap();
    assert_ne!(fresh.id(), order_id);
}

#[tokio::test]
async fn test_cart_edit_cannot_drop_below_coupon_minimum() {
    let shop = Shop::open().await;
    let mug = shop.product("MUG-5", dec!(20.00), 50).await;
    let order_id = shop.front.orders.add_to_cart(shop.customer, mug.id(), 5).await.unwrap().id();
    let order = shop.front.coupons.apply(order_id, "SUMMER10").await.unwrap();
    assert_eq!(order.discount().amount(), dec!(10.00));

    let err = shop.front.orders.update_line(order_id, mug.id(), 2).await.unwrap_err();
    assert_eq!(err.code(), "coupon_below_minimum");
    let err = shop.front.orders.remove_line(order_id, mug.id()).await.unwrap_err();
    assert_eq!(err.code(), "coupon_below_minimum");
    let order = shop.front.orders.get(order_id).await.unwrap();
    assert_eq!((order.subtotal().amount(), order.discount().amount(), order.total().amount()), (dec!(100.00), dec!(10.00), dec!(90.00)));

    let order = shop.front.orders.update_line(order_id, mug.id(), 3).await.unwrap();
    assert_eq!((order.discount().amount(), order.total().amount()), (dec!(6.00), dec!(54.00)));
}

#[tokio::test]
async fn test_inbox_read_flags() {
    let shop = Shop::open().await;
    let order_id = shop.cart(1).await;
    pay(&shop, order_id).await;

    let inbox = shop.front.notifications.list(shop.customer, true).await.unwrap();
    assert_eq!(inbox.len(), 3);
    let read = shop.front.notifications.mark_read(shop.customer, inbox[0].id).await.unwrap();
    assert!(read.is_read());
    assert_eq!(shop.front.notifications.list(shop.customer, true).await.unwrap().len(), 2);
    assert_eq!(shop.front.notifications.list(shop.customer, false).await.unwrap().len(), 3);

    let err = shop.front.notifications.mark_read(shop.admin, inbox[1].id).await.unwrap_err();
    assert_eq!(err.code(), "notification_not_found");
}

#[tokio::test]
async fn test_release_floors_at_zero() {
    let shop = Shop::open().await;
    let order_id = shop.cart(2).await;
    shop.front.coupons.apply(order_id, "SUMMER10").await.unwrap();
    shop.front.coupons.release(shop.summer.id).await.unwrap();
    shop.front.coupons.release(shop.summer.id).await.unwrap();
    assert_eq!(shop.used_count(shop.summer.id).await, 0);
}
