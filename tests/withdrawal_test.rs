mod helpers;

use ecodeli_escrow::gateway::GatewayError;
use ecodeli_escrow::models::*;
use ecodeli_escrow::AppError;
use helpers::*;
use rust_decimal_macros::dec;
use tokio_test::assert_ok;
use uuid::Uuid;

#[tokio::test]
async fn test_completed_withdrawal_debits_exact_amount() {
    let h = TestHarness::new();
    let courier_id = h.funded_courier(dec!(60.00)).await;

    let request = assert_ok!(
        h.withdrawals
            .request_withdrawal(courier_id, dec!(25.00), VALID_IBAN, HOLDER)
            .await
    );
    assert_eq!(request.status_enum(), WithdrawalStatus::Completed);
    assert!(request.fictitious);
    assert!(request.transfer_reference.unwrap().starts_with("sim_tr_"));
    assert!(request.processed_at.is_some());
    // IBAN never leaves the service unmasked
    assert_eq!(request.iban, "FR76****0189");

    assert_eq!(h.balance(courier_id).await, dec!(35.00));
    assert_eq!(h.gateway.transfer_count(), 1);

    let history = h
        .wallets
        .get_transaction_history(courier_id, PageRequest::default(), None)
        .await
        .unwrap();
    let debit = &history.items[0];
    assert_eq!(debit.amount, dec!(-25.00));
    assert_eq!(
        debit.tx_type(),
        Some(WalletTransactionType::FictitiousWithdrawalDebit)
    );
    assert_eq!(debit.withdrawal_id, Some(request.id));
    assert!(debit.description.ends_with("****0189"));
}

#[tokio::test]
async fn test_failed_transfer_is_compensated() {
    let h = TestHarness::new();
    let courier_id = h.funded_courier(dec!(50.00)).await;
    h.gateway.set_fail_transfers(true);

    let request = assert_ok!(
        h.withdrawals
            .request_withdrawal(courier_id, dec!(50.00), VALID_IBAN, HOLDER)
            .await
    );
    assert_eq!(request.status_enum(), WithdrawalStatus::Failed);
    assert!(request.failure_reason.is_some());
    assert_eq!(h.balance(courier_id).await, dec!(50.00));

    let history = h
        .wallets
        .get_transaction_history(courier_id, PageRequest::default(), None)
        .await
        .unwrap();
    // opening credit, debit, reversal
    assert_eq!(history.total_items, 3);
    assert_eq!(
        history.items[0].tx_type(),
        Some(WalletTransactionType::WithdrawalReversal)
    );
    assert_eq!(history.items[0].amount, dec!(50.00));
    assert!(h.wallets.verify_ledger(courier_id).await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_transfer_timeout_leaves_withdrawal_pending() {
    let h = TestHarness::new();
    let courier_id = h.funded_courier(dec!(40.00)).await;
    h.gateway.set_latency(beyond_timeout());

    let err = h
        .withdrawals
        .request_withdrawal(courier_id, dec!(40.00), VALID_IBAN, HOLDER)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Gateway(ref g) if g.is_timeout()));

    // Debit stays in place until the payout is resolved
    assert_eq!(h.balance(courier_id).await, dec!(0));
    let pending = h
        .withdrawals
        .get_history(courier_id, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(pending.items.len(), 1);
    assert!(pending.items[0].is_pending());

    h.gateway.set_latency(std::time::Duration::ZERO);
    let resolved = assert_ok!(
        h.withdrawals
            .resolve_pending_withdrawal(
                pending.items[0].id,
                WithdrawalResolution::Failed {
                    reason: "provider reports no transfer".to_string(),
                },
            )
            .await
    );
    assert_eq!(resolved.status_enum(), WithdrawalStatus::Failed);
    assert_eq!(h.balance(courier_id).await, dec!(40.00));

    // Resolved requests cannot be resolved again
    let err = h
        .withdrawals
        .resolve_pending_withdrawal(
            resolved.id,
            WithdrawalResolution::Completed {
                transfer_reference: "tr_late".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::IllegalState(_)));
    assert_eq!(h.balance(courier_id).await, dec!(40.00));
}

#[tokio::test]
async fn test_provider_server_error_is_not_compensated() {
    let h = TestHarness::new();
    let courier_id = h.funded_courier(dec!(50.00)).await;
    h.gateway.set_transfer_rejection(Some(500));

    let err = h
        .withdrawals
        .request_withdrawal(courier_id, dec!(50.00), VALID_IBAN, HOLDER)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Gateway(GatewayError::Rejected { status: 500, .. })
    ));

    // The transfer may have gone out; the debit stays until resolved
    assert_eq!(h.balance(courier_id).await, dec!(0));
    let history = h
        .withdrawals
        .get_history(courier_id, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(history.items.len(), 1);
    assert!(history.items[0].is_pending());

    // A second request cannot spend the same money
    h.gateway.set_transfer_rejection(None);
    let err = h
        .withdrawals
        .request_withdrawal(courier_id, dec!(50.00), VALID_IBAN, HOLDER)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InsufficientFunds(_)));
}

#[tokio::test]
async fn test_provider_client_error_is_compensated() {
    let h = TestHarness::new();
    let courier_id = h.funded_courier(dec!(50.00)).await;
    h.gateway.set_transfer_rejection(Some(400));

    let request = assert_ok!(
        h.withdrawals
            .request_withdrawal(courier_id, dec!(50.00), VALID_IBAN, HOLDER)
            .await
    );
    assert_eq!(request.status_enum(), WithdrawalStatus::Failed);
    assert_eq!(h.balance(courier_id).await, dec!(50.00));
}

#[tokio::test]
async fn test_resolve_pending_as_completed() {
    let h = TestHarness::new();
    let courier_id = h.funded_courier(dec!(30.00)).await;
    h.gateway.set_latency(beyond_timeout());
    let _ = h
        .withdrawals
        .request_withdrawal(courier_id, dec!(30.00), VALID_IBAN, HOLDER)
        .await;
    let id = h
        .withdrawals
        .get_history(courier_id, PageRequest::default())
        .await
        .unwrap()
        .items[0]
        .id;

    let err = h
        .withdrawals
        .resolve_pending_withdrawal(
            id,
            WithdrawalResolution::Completed {
                transfer_reference: "  ".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let completed = assert_ok!(
        h.withdrawals
            .resolve_pending_withdrawal(
                id,
                WithdrawalResolution::Completed {
                    transfer_reference: "tr_manual_1".to_string(),
                },
            )
            .await
    );
    assert_eq!(completed.status_enum(), WithdrawalStatus::Completed);
    assert_eq!(completed.transfer_reference.as_deref(), Some("tr_manual_1"));
    assert_eq!(h.balance(courier_id).await, dec!(0));
}

#[tokio::test]
async fn test_insufficient_balance() {
    let h = TestHarness::new();
    let courier_id = h.funded_courier(dec!(5.00)).await;

    let err = h
        .withdrawals
        .request_withdrawal(courier_id, dec!(10.00), VALID_IBAN, HOLDER)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InsufficientFunds(_)));
    assert_eq!(h.balance(courier_id).await, dec!(5.00));
    assert_eq!(h.gateway.transfer_count(), 0);
    assert!(h
        .withdrawals
        .get_history(courier_id, PageRequest::default())
        .await
        .unwrap()
        .items
        .is_empty());
}

#[tokio::test]
async fn test_withdrawal_validation() {
    let h = TestHarness::new();
    let courier_id = h.funded_courier(dec!(100.00)).await;

    for (amount, iban, holder) in [
        (dec!(0), VALID_IBAN, HOLDER),
        (dec!(0.50), VALID_IBAN, HOLDER),
        (dec!(10.005), VALID_IBAN, HOLDER),
        (dec!(10.00), "FR76", HOLDER),
        (dec!(10.00), VALID_IBAN, ""),
    ] {
        let err = h
            .withdrawals
            .request_withdrawal(courier_id, amount, iban, holder)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "{:?}", err);
    }
    assert_eq!(h.balance(courier_id).await, dec!(100.00));
}

#[tokio::test]
async fn test_eligibility_reports_each_reason() {
    let h = TestHarness::new();
    let courier_id = Uuid::new_v4();
    h.wallets
        .credit(courier_id, dec!(3.00), "Bonus", WalletTransactionType::BonusCredit, None)
        .await
        .unwrap();

    let eligibility = h.withdrawals.can_withdraw(courier_id, dec!(0.50)).await.unwrap();
    assert!(!eligibility.can_withdraw);
    assert!(!eligibility.has_valid_iban);
    assert!(eligibility.has_sufficient_balance);
    assert!(!eligibility.above_minimum);
    assert_eq!(eligibility.reasons.len(), 2);

    h.wallets
        .update_bank_info(courier_id, VALID_IBAN, HOLDER)
        .await
        .unwrap();
    let eligibility = h.withdrawals.can_withdraw(courier_id, dec!(3.00)).await.unwrap();
    assert!(eligibility.can_withdraw);
    assert!(eligibility.reasons.is_empty());
    assert_eq!(eligibility.available_balance, dec!(3.00));
}

#[tokio::test]
async fn test_history_and_stats() {
    let h = TestHarness::new();
    let courier_id = h.funded_courier(dec!(100.00)).await;

    let first = h
        .withdrawals
        .request_withdrawal(courier_id, dec!(10.00), VALID_IBAN, HOLDER)
        .await
        .unwrap();
    h.gateway.set_fail_transfers(true);
    let second = h
        .withdrawals
        .request_withdrawal(courier_id, dec!(20.00), VALID_IBAN, HOLDER)
        .await
        .unwrap();

    let history = h
        .withdrawals
        .get_history(courier_id, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(history.total_items, 2);
    assert_eq!(history.items[0].id, second.id);
    assert_eq!(history.items[1].id, first.id);
    assert!(history.items.iter().all(|w| w.iban == "FR76****0189"));

    let fetched = h.withdrawals.get_withdrawal(first.id).await.unwrap();
    assert_eq!(fetched.iban, "FR76****0189");
    assert!(h
        .withdrawals
        .get_withdrawal(Uuid::new_v4())
        .await
        .unwrap_err()
        .is_not_found());

    let stats = h.withdrawals.withdrawal_stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.total_completed_amount, dec!(10.00));
    assert_eq!(h.balance(courier_id).await, dec!(90.00));
}
