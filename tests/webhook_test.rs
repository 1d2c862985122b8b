mod helpers;

use ecodeli_escrow::models::*;
use ecodeli_escrow::services::webhook::sign;
use ecodeli_escrow::services::WebhookOutcome;
use ecodeli_escrow::AppError;
use helpers::*;
use rust_decimal_macros::dec;
use tokio_test::assert_ok;

fn signed(payload: &str) -> String {
    sign(WEBHOOK_SECRET, chrono::Utc::now().timestamp(), payload).unwrap()
}

#[tokio::test]
async fn test_succeeded_event_holds_escrow_once() {
    let h = TestHarness::new();
    let (client_id, delivery_id) = h.delivery().await;
    let reference = h
        .escrows
        .open_escrow(client_id, delivery_id, None, dec!(80.00))
        .await
        .unwrap()
        .escrow
        .payment_intent_id;

    let payload = event_payload("payment_intent.succeeded", &reference);
    let header = signed(&payload);

    // Providers redeliver; both deliveries end in the same state
    for _ in 0..2 {
        let outcome = assert_ok!(h.webhooks.handle(&payload, &header).await);
        match outcome {
            WebhookOutcome::EscrowConfirmed(escrow) => {
                assert_eq!(escrow.status_enum(), EscrowStatus::Held)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(h.store.transaction_count().await, 0);
}

#[tokio::test]
async fn test_payment_failed_event_fails_pending_escrow() {
    let h = TestHarness::new();
    let (client_id, delivery_id) = h.delivery().await;
    let reference = h
        .escrows
        .open_escrow(client_id, delivery_id, None, dec!(80.00))
        .await
        .unwrap()
        .escrow
        .payment_intent_id;

    let payload = serde_json::json!({
        "id": "evt_failed",
        "type": "payment_intent.payment_failed",
        "data": {"object": {
            "id": reference,
            "last_payment_error": {"message": "Your card was declined."}
        }}
    })
    .to_string();

    let outcome = h.webhooks.handle(&payload, &signed(&payload)).await.unwrap();
    match outcome {
        WebhookOutcome::EscrowFailed(escrow) => {
            assert_eq!(escrow.status_enum(), EscrowStatus::Failed);
            assert!(escrow.notes.unwrap().contains("card was declined"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_canceled_event_ignores_held_escrow() {
    let h = TestHarness::new();
    let escrow = h.held_escrow(dec!(45.00)).await;

    let payload = event_payload("payment_intent.canceled", &escrow.payment_intent_id);
    let outcome = h.webhooks.handle(&payload, &signed(&payload)).await.unwrap();

    assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
    let escrow = h.escrows.get_escrow(escrow.id).await.unwrap();
    assert_eq!(escrow.status_enum(), EscrowStatus::Held);
}

#[tokio::test]
async fn test_unknown_intent_is_not_found() {
    let h = TestHarness::new();
    let payload = event_payload("payment_intent.succeeded", "pi_nowhere");

    let err = h.webhooks.handle(&payload, &signed(&payload)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_transfer_and_other_events_change_nothing() {
    let h = TestHarness::new();

    let payload = serde_json::json!({
        "id": "evt_tr",
        "type": "transfer.failed",
        "data": {"object": {"id": "tr_1", "metadata": {"withdrawal_id": "w-1"}}}
    })
    .to_string();
    let outcome = h.webhooks.handle(&payload, &signed(&payload)).await.unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::PayoutLogged { ref reference, .. } if reference == "tr_1"
    ));

    let payload = event_payload("customer.created", "cus_1");
    let outcome = h.webhooks.handle(&payload, &signed(&payload)).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Acknowledged { .. }));
    assert_eq!(h.store.transaction_count().await, 0);
}

#[tokio::test]
async fn test_signature_is_enforced() {
    let h = TestHarness::new();
    let escrow = h.held_escrow(dec!(10.00)).await;
    let payload = event_payload("payment_intent.canceled", &escrow.payment_intent_id);
    let now = chrono::Utc::now().timestamp();

    let wrong_secret = sign("whsec_other", now, &payload).unwrap();
    let err = h.webhooks.handle(&payload, &wrong_secret).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    let tampered = signed(&payload.replace("canceled", "succeeded"));
    let err = h.webhooks.handle(&payload, &tampered).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    let stale = sign(WEBHOOK_SECRET, now - 3600, &payload).unwrap();
    let err = h.webhooks.handle(&payload, &stale).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    for header in ["", "t=abc,v1=00", "v1=deadbeef"] {
        let err = h.webhooks.handle(&payload, header).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)), "{:?}", header);
    }

    let escrow = h.escrows.get_escrow(escrow.id).await.unwrap();
    assert_eq!(escrow.status_enum(), EscrowStatus::Held);
}

#[tokio::test]
async fn test_verify_accepts_any_matching_v1() {
    let h = TestHarness::new();
    let payload = "{}";
    let now = 1_700_000_000;
    let good = sign(WEBHOOK_SECRET, now, payload).unwrap();
    let good_sig = good.split("v1=").nth(1).unwrap();
    let header = format!("t={},v1={},v1={}", now, "00".repeat(32), good_sig);

    assert_ok!(h.webhooks.verify(payload, &header, now + 10));
}

#[tokio::test]
async fn test_extreme_timestamps_are_rejected() {
    let h = TestHarness::new();
    let now = 1_700_000_000;

    for header in [
        format!("t={},v1=00", i64::MIN),
        format!("t={},v1=00", i64::MAX),
    ] {
        let err = h.webhooks.verify("{}", &header, now).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)), "{}", header);
    }
}

#[tokio::test]
async fn test_malformed_body_is_rejected_after_verification() {
    let h = TestHarness::new();
    let payload = "not json";
    let err = h.webhooks.handle(payload, &signed(payload)).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}
