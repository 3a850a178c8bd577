//! # Escrow Vault — Custody Abstraction
//!
//! The seam between the engine and whatever actually holds value: an
//! on-chain contract, a ledger table, a bank escrow account. The engine
//! only requires that `hold` and `move_to` are atomic with respect to
//! `balance`, and that `move_to` fails cleanly, leaving the balance
//! unchanged, rather than partially succeeding.
//!
//! Settlement rails confirm asynchronously, so every method returns a
//! `Send` future; the engine awaits confirmation without holding any
//! invoice lock. Rails with no push mechanism implement polling behind
//! this trait, not in the engine's public contract.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use thiserror::Error;

use meq_core::{Amount, InvoiceId, Role};

/// Errors from the settlement rail.
#[derive(Error, Debug)]
pub enum VaultError {
    /// The rail rejected the movement outright.
    #[error("transfer rejected: {reason}")]
    TransferRejected {
        /// The rail's rejection reason.
        reason: String,
    },

    /// The movement would exceed the held balance.
    #[error("insufficient balance: held {held}, requested {requested}")]
    InsufficientBalance {
        /// The amount currently held.
        held: Amount,
        /// The amount the movement requested.
        requested: Amount,
    },

    /// Funds are already held for this invoice.
    #[error("custody already established for {invoice_id}")]
    AlreadyHeld {
        /// The invoice with an existing custody record.
        invoice_id: String,
    },
}

/// The custody abstraction. The only component permitted to change the
/// amount held for an invoice.
pub trait EscrowVault: Send + Sync {
    /// Take custody of `amount` for the given invoice.
    fn hold(
        &self,
        invoice_id: InvoiceId,
        amount: Amount,
    ) -> impl Future<Output = Result<(), VaultError>> + Send;

    /// Move `amount` out of custody to the given recipient role.
    /// Fails cleanly: on error the held balance is unchanged.
    fn move_to(
        &self,
        invoice_id: InvoiceId,
        recipient: Role,
        amount: Amount,
    ) -> impl Future<Output = Result<(), VaultError>> + Send;

    /// The amount currently held for the invoice. Zero if no custody
    /// record exists.
    fn balance(&self, invoice_id: InvoiceId) -> impl Future<Output = Amount> + Send;
}

/// In-memory reference vault.
///
/// Enforces debit-side conservation: value leaves an account only
/// through a successful `move_to`, and a rejected movement leaves the
/// balance untouched. Suitable for tests and for single-process
/// deployments fronting a trusted ledger.
#[derive(Debug, Default)]
pub struct InMemoryVault {
    accounts: Mutex<HashMap<InvoiceId, Amount>>,
}

impl InMemoryVault {
    /// Create an empty vault.
    pub fn new() -> Self {
        Self::default()
    }

    fn do_hold(&self, invoice_id: InvoiceId, amount: Amount) -> Result<(), VaultError> {
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(&invoice_id) {
            return Err(VaultError::AlreadyHeld {
                invoice_id: invoice_id.to_string(),
            });
        }
        accounts.insert(invoice_id, amount);
        Ok(())
    }

    fn do_move(&self, invoice_id: InvoiceId, amount: Amount) -> Result<(), VaultError> {
        let mut accounts = self.accounts.lock();
        let held = accounts.get(&invoice_id).copied().unwrap_or(Amount::ZERO);
        let remaining = held.checked_sub(amount).ok_or(VaultError::InsufficientBalance {
            held,
            requested: amount,
        })?;
        accounts.insert(invoice_id, remaining);
        Ok(())
    }

    fn do_balance(&self, invoice_id: InvoiceId) -> Amount {
        self.accounts
            .lock()
            .get(&invoice_id)
            .copied()
            .unwrap_or(Amount::ZERO)
    }
}

impl EscrowVault for InMemoryVault {
    fn hold(
        &self,
        invoice_id: InvoiceId,
        amount: Amount,
    ) -> impl Future<Output = Result<(), VaultError>> + Send {
        let result = self.do_hold(invoice_id, amount);
        async move { result }
    }

    fn move_to(
        &self,
        invoice_id: InvoiceId,
        _recipient: Role,
        amount: Amount,
    ) -> impl Future<Output = Result<(), VaultError>> + Send {
        let result = self.do_move(invoice_id, amount);
        async move { result }
    }

    fn balance(&self, invoice_id: InvoiceId) -> impl Future<Output = Amount> + Send {
        let balance = self.do_balance(invoice_id);
        async move { balance }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hold_then_balance() {
        let vault = InMemoryVault::new();
        let id = InvoiceId::new();
        vault.hold(id, Amount::from_minor(3000)).await.unwrap();
        assert_eq!(vault.balance(id).await, Amount::from_minor(3000));
    }

    #[tokio::test]
    async fn test_double_hold_rejected() {
        let vault = InMemoryVault::new();
        let id = InvoiceId::new();
        vault.hold(id, Amount::from_minor(100)).await.unwrap();
        let err = vault.hold(id, Amount::from_minor(100)).await.unwrap_err();
        assert!(matches!(err, VaultError::AlreadyHeld { .. }));
        assert_eq!(vault.balance(id).await, Amount::from_minor(100));
    }

    #[tokio::test]
    async fn test_move_debits_balance() {
        let vault = InMemoryVault::new();
        let id = InvoiceId::new();
        vault.hold(id, Amount::from_minor(3000)).await.unwrap();
        vault
            .move_to(id, Role::Payee, Amount::from_minor(1000))
            .await
            .unwrap();
        assert_eq!(vault.balance(id).await, Amount::from_minor(2000));
    }

    #[tokio::test]
    async fn test_overdraw_fails_cleanly() {
        let vault = InMemoryVault::new();
        let id = InvoiceId::new();
        vault.hold(id, Amount::from_minor(500)).await.unwrap();
        let err = vault
            .move_to(id, Role::Payee, Amount::from_minor(501))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InsufficientBalance { .. }));
        // Balance untouched by the failed movement.
        assert_eq!(vault.balance(id).await, Amount::from_minor(500));
    }

    #[tokio::test]
    async fn test_unknown_account_balance_is_zero() {
        let vault = InMemoryVault::new();
        assert_eq!(vault.balance(InvoiceId::new()).await, Amount::ZERO);
    }
}
