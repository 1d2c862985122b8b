//! PostgreSQL escrow operations

use super::wallet_repository::{apply_entry, lock_or_create_wallet};
use super::{append_note, EscrowStore, PgLedgerStore, StoreResult};
use crate::error::RepositoryError;
use crate::models::{
    EscrowFilter, EscrowRelease, EscrowStats, EscrowStatus, EscrowTransaction, LedgerEntry,
    ReleasedEscrow, TransitionUpdate, WalletTransactionType,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use uuid::Uuid;

const ESCROW_COLUMNS: &str = "id, payment_intent_id, client_id, delivery_id, segment_number, \
     total_amount, commission_amount, courier_amount, status, courier_id, refund_id, notes, \
     unconfirmed_release, refund_requested_at, created_at, held_since, released_at, updated_at";

fn status_list(statuses: &[EscrowStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl EscrowStore for PgLedgerStore {
    async fn insert_escrow(&self, escrow: &EscrowTransaction) -> StoreResult<EscrowTransaction> {
        // Unique indexes on the payment reference and the active slot surface
        // as RepositoryError::Duplicate
        let inserted = sqlx::query_as::<_, EscrowTransaction>(&format!(
            r#"
            INSERT INTO escrow_transactions
                (id, payment_intent_id, client_id, delivery_id, segment_number, total_amount,
                 commission_amount, courier_amount, status, notes, unconfirmed_release,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE, $11, $11)
            RETURNING {}
            "#,
            ESCROW_COLUMNS
        ))
        .bind(escrow.id)
        .bind(&escrow.payment_intent_id)
        .bind(escrow.client_id)
        .bind(escrow.delivery_id)
        .bind(escrow.segment_number)
        .bind(escrow.total_amount)
        .bind(escrow.commission_amount)
        .bind(escrow.courier_amount)
        .bind(&escrow.status)
        .bind(&escrow.notes)
        .bind(escrow.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn find_escrow(&self, id: Uuid) -> StoreResult<Option<EscrowTransaction>> {
        let escrow = sqlx::query_as::<_, EscrowTransaction>(&format!(
            "SELECT {} FROM escrow_transactions WHERE id = $1",
            ESCROW_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(escrow)
    }

    async fn find_escrow_by_payment_ref(
        &self,
        payment_intent_id: &str,
    ) -> StoreResult<Option<EscrowTransaction>> {
        let escrow = sqlx::query_as::<_, EscrowTransaction>(&format!(
            "SELECT {} FROM escrow_transactions WHERE payment_intent_id = $1",
            ESCROW_COLUMNS
        ))
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(escrow)
    }

    async fn find_active_escrow(
        &self,
        delivery_id: Uuid,
        segment_number: Option<i32>,
    ) -> StoreResult<Option<EscrowTransaction>> {
        let escrow = sqlx::query_as::<_, EscrowTransaction>(&format!(
            r#"
            SELECT {}
            FROM escrow_transactions
            WHERE delivery_id = $1
              AND segment_number IS NOT DISTINCT FROM $2
              AND status IN ('PENDING', 'HELD')
            "#,
            ESCROW_COLUMNS
        ))
        .bind(delivery_id)
        .bind(segment_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(escrow)
    }

    async fn list_escrows(&self, filter: EscrowFilter) -> StoreResult<Vec<EscrowTransaction>> {
        let column = match filter {
            EscrowFilter::Delivery(_) => "delivery_id",
            EscrowFilter::Client(_) => "client_id",
            EscrowFilter::Courier(_) => "courier_id",
            EscrowFilter::Status(_) => "status",
        };
        let sql = format!(
            "SELECT {} FROM escrow_transactions WHERE {} = $1 ORDER BY created_at DESC, id DESC",
            ESCROW_COLUMNS, column
        );

        let q = sqlx::query_as::<_, EscrowTransaction>(&sql);
        let q = match filter {
            EscrowFilter::Delivery(id) | EscrowFilter::Client(id) | EscrowFilter::Courier(id) => {
                q.bind(id)
            }
            EscrowFilter::Status(status) => q.bind(status.as_str()),
        };

        Ok(q.fetch_all(&self.pool).await?)
    }

    async fn transition_escrow(
        &self,
        id: Uuid,
        from: &[EscrowStatus],
        to: EscrowStatus,
        update: TransitionUpdate,
    ) -> StoreResult<EscrowTransaction> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, EscrowTransaction>(&format!(
            "SELECT {} FROM escrow_transactions WHERE id = $1 FOR UPDATE",
            ESCROW_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("Escrow {} not found", id)))?;

        let status = current.status_enum();
        if !from.contains(&status) {
            return Err(RepositoryError::InvalidState(format!(
                "Escrow {} is {}, expected one of {:?}",
                id,
                status.as_str(),
                status_list(from)
            )));
        }

        let now = chrono::Utc::now().naive_utc();
        let held_since = if to == EscrowStatus::Held {
            Some(now)
        } else {
            current.held_since
        };
        let notes = append_note(current.notes.as_deref(), update.note.as_deref());
        let refund_id = update.refund_id.or(current.refund_id);

        let updated = sqlx::query_as::<_, EscrowTransaction>(&format!(
            r#"
            UPDATE escrow_transactions
            SET status = $2, held_since = $3, notes = $4, refund_id = $5, updated_at = $6
            WHERE id = $1
            RETURNING {}
            "#,
            ESCROW_COLUMNS
        ))
        .bind(id)
        .bind(to.as_str())
        .bind(held_since)
        .bind(notes)
        .bind(refund_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn claim_refund(&self, id: Uuid) -> StoreResult<EscrowTransaction> {
        let claimed = sqlx::query_as::<_, EscrowTransaction>(&format!(
            r#"
            UPDATE escrow_transactions
            SET refund_requested_at = $2, updated_at = $2
            WHERE id = $1
              AND status IN ('PENDING', 'HELD')
              AND refund_requested_at IS NULL
            RETURNING {}
            "#,
            ESCROW_COLUMNS
        ))
        .bind(id)
        .bind(chrono::Utc::now().naive_utc())
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some(escrow) => Ok(escrow),
            None => {
                let current = self
                    .find_escrow(id)
                    .await?
                    .ok_or_else(|| RepositoryError::NotFound(format!("Escrow {} not found", id)))?;
                Err(RepositoryError::InvalidState(if current.has_refund_claim() {
                    format!("Escrow {} already has a refund in progress", id)
                } else {
                    format!("Escrow {} is {} and cannot be refunded", id, current.status)
                }))
            }
        }
    }

    async fn clear_refund_claim(&self, id: Uuid) -> StoreResult<EscrowTransaction> {
        sqlx::query_as::<_, EscrowTransaction>(&format!(
            r#"
            UPDATE escrow_transactions
            SET refund_requested_at = NULL, updated_at = $2
            WHERE id = $1
            RETURNING {}
            "#,
            ESCROW_COLUMNS
        ))
        .bind(id)
        .bind(chrono::Utc::now().naive_utc())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("Escrow {} not found", id)))
    }

    async fn release_escrow(&self, release: &EscrowRelease) -> StoreResult<ReleasedEscrow> {
        let mut tx = self.pool.begin().await?;

        let escrow = sqlx::query_as::<_, EscrowTransaction>(&format!(
            "SELECT {} FROM escrow_transactions WHERE id = $1 FOR UPDATE",
            ESCROW_COLUMNS
        ))
        .bind(release.escrow_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            RepositoryError::NotFound(format!("Escrow {} not found", release.escrow_id))
        })?;

        if escrow.has_refund_claim() {
            return Err(RepositoryError::InvalidState(format!(
                "Escrow {} has a refund in progress",
                escrow.id
            )));
        }
        let was_unconfirmed = match escrow.status_enum() {
            EscrowStatus::Held => false,
            EscrowStatus::Pending if release.allow_unconfirmed => true,
            other => {
                return Err(RepositoryError::InvalidState(format!(
                    "Escrow {} is {} and cannot be released",
                    escrow.id,
                    other.as_str()
                )))
            }
        };

        let wallet = lock_or_create_wallet(&mut *tx, release.courier_id).await?;
        let entry = LedgerEntry::new(
            release.courier_id,
            escrow.courier_amount,
            WalletTransactionType::DeliveryCredit,
            release.description.clone(),
        )
        .for_delivery(escrow.delivery_id)
        .for_escrow(escrow.id);
        let movement = apply_entry(&mut *tx, &wallet, &entry, escrow.courier_amount).await?;

        let now = chrono::Utc::now().naive_utc();
        let note = was_unconfirmed.then(|| {
            format!("Released before payment confirmation to courier {}", release.courier_id)
        });
        let notes = append_note(escrow.notes.as_deref(), note.as_deref());

        let released = sqlx::query_as::<_, EscrowTransaction>(&format!(
            r#"
            UPDATE escrow_transactions
            SET status = 'RELEASED', courier_id = $2, released_at = $3, updated_at = $3,
                unconfirmed_release = $4, notes = $5
            WHERE id = $1
            RETURNING {}
            "#,
            ESCROW_COLUMNS
        ))
        .bind(escrow.id)
        .bind(release.courier_id)
        .bind(now)
        .bind(was_unconfirmed)
        .bind(notes)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ReleasedEscrow {
            escrow: released,
            movement,
            was_unconfirmed,
        })
    }

    async fn escrow_stats(&self) -> StoreResult<EscrowStats> {
        let rows: Vec<(String, i64, Decimal, Decimal)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*), COALESCE(SUM(commission_amount), 0), COALESCE(SUM(total_amount), 0)
            FROM escrow_transactions
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = EscrowStats::default();
        for (status, count, commission, total) in rows {
            let status = EscrowStatus::from_str(&status).map_err(RepositoryError::InvalidState)?;
            *stats.count_for(status) += count;
            match status {
                EscrowStatus::Released => stats.total_commission_released += commission,
                EscrowStatus::Pending | EscrowStatus::Held => stats.total_in_escrow += total,
                _ => {}
            }
        }

        Ok(stats)
    }

    async fn list_stale_escrows(
        &self,
        pending_before: NaiveDateTime,
    ) -> StoreResult<Vec<EscrowTransaction>> {
        let escrows = sqlx::query_as::<_, EscrowTransaction>(&format!(
            r#"
            SELECT {}
            FROM escrow_transactions
            WHERE (status = 'PENDING' AND created_at < $1)
               OR (status IN ('PENDING', 'HELD') AND refund_requested_at < $1)
               OR (status = 'RELEASED' AND unconfirmed_release)
            ORDER BY created_at ASC
            "#,
            ESCROW_COLUMNS
        ))
        .bind(pending_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(escrows)
    }
}
