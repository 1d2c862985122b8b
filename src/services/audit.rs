use crate::error::{AppError, AppResult};
use crate::models::{EscrowTransaction, WithdrawalRequest};
use crate::money::iban_suffix;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: i64,
    pub event_type: String, // "escrow_opened", "funds_released", "withdrawal_failed", etc.
    pub escrow_id: Option<Uuid>,
    pub courier_id: Option<Uuid>,
    pub details: serde_json::Value,
}

/// Append-only JSON-lines audit trail of money movements
pub struct AuditTrailService {
    log_file: PathBuf,
    file_handle: Arc<Mutex<std::fs::File>>,
}

impl AuditTrailService {
    /// Create a new audit trail service
    pub fn new(log_directory: PathBuf) -> AppResult<Self> {
        std::fs::create_dir_all(&log_directory)
            .map_err(|e| AppError::Message(format!("Failed to create log directory: {}", e)))?;

        // Named for the day the service started; the file is not rotated
        let date = chrono::Utc::now().format("%Y-%m-%d");
        let log_file = log_directory.join(format!("escrow_audit_{}.log", date));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .map_err(|e| AppError::Message(format!("Failed to open audit log file: {}", e)))?;

        info!("Audit trail initialized: {:?}", log_file);

        Ok(Self {
            log_file,
            file_handle: Arc::new(Mutex::new(file)),
        })
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Log an audit entry
    pub async fn log(&self, entry: AuditLogEntry) -> AppResult<()> {
        let json = serde_json::to_string(&entry).map_err(AppError::Serialization)?;

        let mut file = self.file_handle.lock().await;
        writeln!(file, "{}", json)
            .map_err(|e| AppError::Message(format!("Failed to write audit log: {}", e)))?;

        file.flush()
            .map_err(|e| AppError::Message(format!("Failed to flush audit log: {}", e)))?;

        Ok(())
    }

    /// Write an entry; a failed audit write never fails the money operation
    async fn record(&self, entry: AuditLogEntry) {
        let event_type = entry.event_type.clone();
        if let Err(e) = self.log(entry).await {
            error!("Audit write for {} failed: {}", event_type, e);
        }
    }

    fn escrow_entry(event_type: &str, escrow: &EscrowTransaction, extra: serde_json::Value) -> AuditLogEntry {
        let mut details = serde_json::json!({
            "payment_intent_id": escrow.payment_intent_id,
            "delivery_id": escrow.delivery_id.to_string(),
            "segment_number": escrow.segment_number,
            "client_id": escrow.client_id.to_string(),
            "total_amount": escrow.total_amount.to_string(),
            "commission_amount": escrow.commission_amount.to_string(),
            "courier_amount": escrow.courier_amount.to_string(),
            "status": escrow.status,
        });
        if let (Some(map), serde_json::Value::Object(more)) = (details.as_object_mut(), extra) {
            map.extend(more);
        }

        AuditLogEntry {
            timestamp: chrono::Utc::now().timestamp(),
            event_type: event_type.to_string(),
            escrow_id: Some(escrow.id),
            courier_id: escrow.courier_id,
            details,
        }
    }

    fn withdrawal_entry(event_type: &str, request: &WithdrawalRequest) -> AuditLogEntry {
        AuditLogEntry {
            timestamp: chrono::Utc::now().timestamp(),
            event_type: event_type.to_string(),
            escrow_id: None,
            courier_id: Some(request.courier_id),
            details: serde_json::json!({
                "withdrawal_id": request.id.to_string(),
                "amount": request.amount.to_string(),
                "iban_suffix": iban_suffix(&request.iban),
                "fictitious": request.fictitious,
                "transfer_reference": request.transfer_reference,
                "failure_reason": request.failure_reason,
            }),
        }
    }

    pub async fn log_escrow_opened(&self, escrow: &EscrowTransaction) {
        self.record(Self::escrow_entry("escrow_opened", escrow, serde_json::json!({})))
            .await
    }

    pub async fn log_escrow_held(&self, escrow: &EscrowTransaction) {
        self.record(Self::escrow_entry("escrow_held", escrow, serde_json::json!({})))
            .await
    }

    pub async fn log_escrow_failed(&self, escrow: &EscrowTransaction, reason: &str) {
        self.record(Self::escrow_entry(
            "escrow_failed",
            escrow,
            serde_json::json!({ "reason": reason }),
        ))
        .await
    }

    pub async fn log_funds_released(&self, escrow: &EscrowTransaction, unconfirmed: bool) {
        self.record(Self::escrow_entry(
            "funds_released",
            escrow,
            serde_json::json!({ "unconfirmed_release": unconfirmed }),
        ))
        .await
    }

    pub async fn log_escrow_refunded(&self, escrow: &EscrowTransaction, reason: &str) {
        self.record(Self::escrow_entry(
            "escrow_refunded",
            escrow,
            serde_json::json!({ "reason": reason, "refund_id": escrow.refund_id }),
        ))
        .await
    }

    pub async fn log_withdrawal_completed(&self, request: &WithdrawalRequest) {
        self.record(Self::withdrawal_entry("withdrawal_completed", request))
            .await
    }

    pub async fn log_withdrawal_failed(&self, request: &WithdrawalRequest) {
        self.record(Self::withdrawal_entry("withdrawal_failed", request))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewEscrow;
    use crate::money::split_commission;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_entries_are_json_lines() {
        let dir = std::env::temp_dir().join(format!("escrow_audit_{}", Uuid::new_v4()));
        let audit = AuditTrailService::new(dir.clone()).unwrap();

        let escrow = EscrowTransaction::new(NewEscrow {
            payment_intent_id: "sim_pi_1".to_string(),
            client_id: Uuid::new_v4(),
            delivery_id: Uuid::new_v4(),
            segment_number: None,
            split: split_commission(Decimal::new(10000, 2), Decimal::new(10, 2)),
        });
        audit.log_escrow_opened(&escrow).await;
        audit.log_escrow_failed(&escrow, "card declined").await;

        let content = std::fs::read_to_string(audit.log_file()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "escrow_opened");
        assert_eq!(lines[0]["details"]["commission_amount"], "10.00");
        assert_eq!(lines[1]["details"]["reason"], "card declined");

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_file_is_named_for_start_date() {
        let dir = std::env::temp_dir().join(format!("escrow_audit_{}", Uuid::new_v4()));
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let audit = AuditTrailService::new(dir.clone()).unwrap();

        let name = audit.log_file().file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, format!("escrow_audit_{}.log", today));
        assert!(audit.log_file().starts_with(&dir));

        std::fs::remove_dir_all(dir).ok();
    }
}
