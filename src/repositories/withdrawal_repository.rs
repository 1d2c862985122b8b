//! PostgreSQL withdrawal operations

use super::wallet_repository::{apply_entry, lock_or_create_wallet};
use super::{reversal_description, PgLedgerStore, StoreResult, WithdrawalStore};
use crate::error::RepositoryError;
use crate::models::{
    LedgerEntry, NewWithdrawal, OpenedWithdrawal, Page, PageRequest, WalletTransactionType,
    WithdrawalRequest, WithdrawalStats, WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use sqlx::PgConnection;
use uuid::Uuid;

const WITHDRAWAL_COLUMNS: &str = "id, courier_id, wallet_id, amount, iban, account_holder, \
     status, fictitious, transfer_reference, failure_reason, requested_at, processed_at";

async fn lock_pending_withdrawal(
    conn: &mut PgConnection,
    id: Uuid,
) -> StoreResult<WithdrawalRequest> {
    let request = sqlx::query_as::<_, WithdrawalRequest>(&format!(
        "SELECT {} FROM withdrawal_requests WHERE id = $1 FOR UPDATE",
        WITHDRAWAL_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| RepositoryError::NotFound(format!("Withdrawal {} not found", id)))?;

    if !request.is_pending() {
        return Err(RepositoryError::InvalidState(format!(
            "Withdrawal {} is already {}",
            id, request.status
        )));
    }

    Ok(request)
}

#[async_trait]
impl WithdrawalStore for PgLedgerStore {
    async fn open_withdrawal(&self, new: &NewWithdrawal) -> StoreResult<OpenedWithdrawal> {
        let mut tx = self.pool.begin().await?;

        // Balance is re-checked under the wallet lock, not trusted from the caller
        let wallet = lock_or_create_wallet(&mut *tx, new.courier_id).await?;
        if wallet.available_balance < new.amount {
            return Err(RepositoryError::InsufficientFunds(format!(
                "available {}, requested {}",
                wallet.available_balance, new.amount
            )));
        }

        let pending = WithdrawalRequest::new(wallet.id, new);
        let request = sqlx::query_as::<_, WithdrawalRequest>(&format!(
            r#"
            INSERT INTO withdrawal_requests
                (id, courier_id, wallet_id, amount, iban, account_holder, status, fictitious, requested_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(pending.id)
        .bind(pending.courier_id)
        .bind(pending.wallet_id)
        .bind(pending.amount)
        .bind(&pending.iban)
        .bind(&pending.account_holder)
        .bind(&pending.status)
        .bind(pending.fictitious)
        .bind(pending.requested_at)
        .fetch_one(&mut *tx)
        .await?;

        let entry = LedgerEntry::new(new.courier_id, new.amount, new.debit_type, new.description.clone())
            .for_withdrawal(request.id);
        let movement = apply_entry(&mut *tx, &wallet, &entry, -new.amount).await?;

        tx.commit().await?;

        Ok(OpenedWithdrawal { request, movement })
    }

    async fn complete_withdrawal(
        &self,
        id: Uuid,
        transfer_reference: &str,
    ) -> StoreResult<WithdrawalRequest> {
        let mut tx = self.pool.begin().await?;
        lock_pending_withdrawal(&mut *tx, id).await?;

        let completed = sqlx::query_as::<_, WithdrawalRequest>(&format!(
            r#"
            UPDATE withdrawal_requests
            SET status = 'COMPLETED', transfer_reference = $2, processed_at = $3
            WHERE id = $1
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(id)
        .bind(transfer_reference)
        .bind(chrono::Utc::now().naive_utc())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(completed)
    }

    async fn fail_withdrawal(&self, id: Uuid, reason: &str) -> StoreResult<WithdrawalRequest> {
        let mut tx = self.pool.begin().await?;
        let request = lock_pending_withdrawal(&mut *tx, id).await?;

        let wallet = lock_or_create_wallet(&mut *tx, request.courier_id).await?;
        let entry = LedgerEntry::new(
            request.courier_id,
            request.amount,
            WalletTransactionType::WithdrawalReversal,
            reversal_description(request.id, reason),
        )
        .for_withdrawal(request.id);
        apply_entry(&mut *tx, &wallet, &entry, request.amount).await?;

        let failed = sqlx::query_as::<_, WithdrawalRequest>(&format!(
            r#"
            UPDATE withdrawal_requests
            SET status = 'FAILED', failure_reason = $2, processed_at = $3
            WHERE id = $1
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(id)
        .bind(reason)
        .bind(chrono::Utc::now().naive_utc())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(failed)
    }

    async fn find_withdrawal(&self, id: Uuid) -> StoreResult<Option<WithdrawalRequest>> {
        let request = sqlx::query_as::<_, WithdrawalRequest>(&format!(
            "SELECT {} FROM withdrawal_requests WHERE id = $1",
            WITHDRAWAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(request)
    }

    async fn list_withdrawals(
        &self,
        courier_id: Uuid,
        page: PageRequest,
    ) -> StoreResult<Page<WithdrawalRequest>> {
        let items = sqlx::query_as::<_, WithdrawalRequest>(&format!(
            r#"
            SELECT {}
            FROM withdrawal_requests
            WHERE courier_id = $1
            ORDER BY requested_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(courier_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM withdrawal_requests WHERE courier_id = $1")
                .bind(courier_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(Page::new(items, page, total))
    }

    async fn list_pending_withdrawals(
        &self,
        requested_before: NaiveDateTime,
    ) -> StoreResult<Vec<WithdrawalRequest>> {
        let requests = sqlx::query_as::<_, WithdrawalRequest>(&format!(
            r#"
            SELECT {}
            FROM withdrawal_requests
            WHERE status = 'PENDING' AND requested_at < $1
            ORDER BY requested_at ASC
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(requested_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(requests)
    }

    async fn withdrawal_stats(&self) -> StoreResult<WithdrawalStats> {
        let rows: Vec<(String, i64, Decimal)> = sqlx::query_as(
            "SELECT status, COUNT(*), COALESCE(SUM(amount), 0) FROM withdrawal_requests GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = WithdrawalStats::default();
        for (status, count, amount) in rows {
            match WithdrawalStatus::from_str(&status).map_err(RepositoryError::InvalidState)? {
                WithdrawalStatus::Pending => {
                    stats.pending = count;
                    stats.total_pending_amount = amount;
                }
                WithdrawalStatus::Completed => {
                    stats.completed = count;
                    stats.total_completed_amount = amount;
                }
                WithdrawalStatus::Failed => stats.failed = count,
            }
        }

        Ok(stats)
    }
}
