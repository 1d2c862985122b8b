//! PostgreSQL wallet and ledger-entry operations

use super::{next_balance, PgLedgerStore, StoreResult, WalletStore};
use crate::models::{
    GlobalWalletStats, LedgerEntry, Page, PageRequest, Wallet, WalletMovement, WalletStats,
    WalletTransaction, WalletTransactionType,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgConnection;
use uuid::Uuid;

pub(crate) const WALLET_COLUMNS: &str = "id, courier_id, available_balance, pending_balance, \
     iban, account_holder, created_at, updated_at";

pub(crate) const WALLET_TX_COLUMNS: &str = "id, wallet_id, amount, transaction_type, description, \
     delivery_id, escrow_id, withdrawal_id, external_reference, status, balance_before, \
     balance_after, created_at";

/// Fetch the courier's wallet with a row lock, creating it first if needed.
pub(crate) async fn lock_or_create_wallet(
    conn: &mut PgConnection,
    courier_id: Uuid,
) -> StoreResult<Wallet> {
    let now = chrono::Utc::now().naive_utc();
    sqlx::query(
        r#"
        INSERT INTO wallets (id, courier_id, available_balance, pending_balance, created_at, updated_at)
        VALUES ($1, $2, 0, 0, $3, $3)
        ON CONFLICT (courier_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(courier_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let wallet = sqlx::query_as::<_, Wallet>(&format!(
        "SELECT {} FROM wallets WHERE courier_id = $1 FOR UPDATE",
        WALLET_COLUMNS
    ))
    .bind(courier_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(wallet)
}

/// Apply a signed movement to a locked wallet and append its ledger entry.
/// The caller owns the transaction and must hold the wallet row lock.
pub(crate) async fn apply_entry(
    conn: &mut PgConnection,
    wallet: &Wallet,
    entry: &LedgerEntry,
    signed_amount: Decimal,
) -> StoreResult<WalletMovement> {
    let balance_after = next_balance(wallet.available_balance, signed_amount)?;

    let now = chrono::Utc::now().naive_utc();
    let record = entry.to_transaction(wallet, signed_amount, balance_after, now);

    let updated = sqlx::query_as::<_, Wallet>(&format!(
        r#"
        UPDATE wallets
        SET available_balance = $2, updated_at = $3
        WHERE id = $1
        RETURNING {}
        "#,
        WALLET_COLUMNS
    ))
    .bind(wallet.id)
    .bind(balance_after)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    let transaction = sqlx::query_as::<_, WalletTransaction>(&format!(
        r#"
        INSERT INTO wallet_transactions
            (id, wallet_id, amount, transaction_type, description, delivery_id, escrow_id,
             withdrawal_id, external_reference, status, balance_before, balance_after, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING {}
        "#,
        WALLET_TX_COLUMNS
    ))
    .bind(record.id)
    .bind(record.wallet_id)
    .bind(record.amount)
    .bind(&record.transaction_type)
    .bind(&record.description)
    .bind(record.delivery_id)
    .bind(record.escrow_id)
    .bind(record.withdrawal_id)
    .bind(&record.external_reference)
    .bind(&record.status)
    .bind(record.balance_before)
    .bind(record.balance_after)
    .bind(record.created_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(WalletMovement {
        wallet: updated,
        transaction,
    })
}

#[async_trait]
impl WalletStore for PgLedgerStore {
    async fn find_wallet(&self, courier_id: Uuid) -> StoreResult<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {} FROM wallets WHERE courier_id = $1",
            WALLET_COLUMNS
        ))
        .bind(courier_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn get_or_create_wallet(&self, courier_id: Uuid) -> StoreResult<Wallet> {
        if let Some(wallet) = self.find_wallet(courier_id).await? {
            return Ok(wallet);
        }

        let now = chrono::Utc::now().naive_utc();
        // A concurrent creator may win the race; the upsert then returns its row.
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            r#"
            INSERT INTO wallets (id, courier_id, available_balance, pending_balance, created_at, updated_at)
            VALUES ($1, $2, 0, 0, $3, $3)
            ON CONFLICT (courier_id) DO UPDATE SET courier_id = EXCLUDED.courier_id
            RETURNING {}
            "#,
            WALLET_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(courier_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn credit_wallet(&self, entry: &LedgerEntry) -> StoreResult<WalletMovement> {
        let mut tx = self.pool.begin().await?;
        let wallet = lock_or_create_wallet(&mut *tx, entry.courier_id).await?;
        let movement = apply_entry(&mut *tx, &wallet, entry, entry.amount).await?;
        tx.commit().await?;
        Ok(movement)
    }

    async fn debit_wallet(&self, entry: &LedgerEntry) -> StoreResult<WalletMovement> {
        let mut tx = self.pool.begin().await?;
        let wallet = lock_or_create_wallet(&mut *tx, entry.courier_id).await?;
        // Dropping `tx` on error rolls back the lazily created wallet too
        let movement = apply_entry(&mut *tx, &wallet, entry, -entry.amount).await?;
        tx.commit().await?;
        Ok(movement)
    }

    async fn update_bank_info(
        &self,
        courier_id: Uuid,
        iban: &str,
        account_holder: &str,
    ) -> StoreResult<Wallet> {
        let mut tx = self.pool.begin().await?;
        let wallet = lock_or_create_wallet(&mut *tx, courier_id).await?;

        let updated = sqlx::query_as::<_, Wallet>(&format!(
            r#"
            UPDATE wallets
            SET iban = $2, account_holder = $3, updated_at = $4
            WHERE id = $1
            RETURNING {}
            "#,
            WALLET_COLUMNS
        ))
        .bind(wallet.id)
        .bind(iban)
        .bind(account_holder)
        .bind(chrono::Utc::now().naive_utc())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn list_wallet_transactions(
        &self,
        wallet_id: Uuid,
        transaction_type: Option<WalletTransactionType>,
        page: PageRequest,
    ) -> StoreResult<Page<WalletTransaction>> {
        let type_filter = transaction_type.map(|t| t.as_str());

        let items = sqlx::query_as::<_, WalletTransaction>(&format!(
            r#"
            SELECT {}
            FROM wallet_transactions
            WHERE wallet_id = $1 AND ($2::TEXT IS NULL OR transaction_type = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
            WALLET_TX_COLUMNS
        ))
        .bind(wallet_id)
        .bind(type_filter)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM wallet_transactions
            WHERE wallet_id = $1 AND ($2::TEXT IS NULL OR transaction_type = $2)
            "#,
        )
        .bind(wallet_id)
        .bind(type_filter)
        .fetch_one(&self.pool)
        .await?;

        Ok(Page::new(items, page, total))
    }

    async fn wallet_stats(&self, wallet: &Wallet) -> StoreResult<WalletStats> {
        let (total_earnings, delivery_count, withdrawn, reversed): (Decimal, i64, Decimal, Decimal) =
            sqlx::query_as(
                r#"
                SELECT
                    COALESCE(SUM(amount) FILTER (WHERE transaction_type = 'delivery_credit'), 0),
                    COUNT(*) FILTER (WHERE transaction_type = 'delivery_credit'),
                    COALESCE(SUM(-amount) FILTER (
                        WHERE transaction_type IN ('withdrawal_debit', 'fictitious_withdrawal_debit')
                    ), 0),
                    COALESCE(SUM(amount) FILTER (WHERE transaction_type = 'withdrawal_reversal'), 0)
                FROM wallet_transactions
                WHERE wallet_id = $1
                "#,
            )
            .bind(wallet.id)
            .fetch_one(&self.pool)
            .await?;

        Ok(WalletStats {
            available_balance: wallet.available_balance,
            pending_balance: wallet.pending_balance,
            total_earnings,
            total_withdrawn: withdrawn - reversed,
            delivery_count,
            bank_details_configured: wallet.has_bank_details(),
        })
    }

    async fn global_wallet_stats(&self, min_withdrawal: Decimal) -> StoreResult<GlobalWalletStats> {
        let (total_available, total_pending, eligible): (Decimal, Decimal, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(available_balance), 0),
                COALESCE(SUM(pending_balance), 0),
                COUNT(*) FILTER (
                    WHERE iban IS NOT NULL AND btrim(iban) <> ''
                      AND account_holder IS NOT NULL AND btrim(account_holder) <> ''
                      AND available_balance >= $1
                )
            FROM wallets
            "#,
        )
        .bind(min_withdrawal)
        .fetch_one(&self.pool)
        .await?;

        Ok(GlobalWalletStats {
            total_available,
            total_pending,
            wallets_eligible_for_withdrawal: eligible,
        })
    }

    async fn ledger_balance(&self, wallet_id: Uuid) -> StoreResult<Decimal> {
        let balance: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM wallet_transactions WHERE wallet_id = $1",
        )
        .bind(wallet_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(balance)
    }
}
