//! Domain models for the escrow and wallet ledger.
//!
//! Database-backed records store their status as TEXT; each has a matching
//! enum for type-safe handling in services.

pub mod escrow;
pub mod page;
pub mod wallet;
pub mod withdrawal;

pub use escrow::{
    EscrowFilter, EscrowRelease, EscrowSlot, EscrowStats, EscrowStatus, EscrowTransaction, NewEscrow,
    OpenedEscrow, ReleasedEscrow, TransitionUpdate,
};
pub use page::{Page, PageRequest};
pub use wallet::{
    GlobalWalletStats, LedgerCheck, LedgerEntry, Wallet, WalletMovement, WalletStats,
    WalletTransaction, WalletTransactionType, WalletView,
};
pub use withdrawal::{
    NewWithdrawal, OpenedWithdrawal, WithdrawalEligibility, WithdrawalRequest, WithdrawalResolution,
    WithdrawalStats, WithdrawalStatus,
};
