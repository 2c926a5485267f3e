//! Bean-managed transaction demarcation.

use super::{Status, Transaction, TransactionManager};
use crate::error::TransactionError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Handle a bean-managed bean uses to begin and complete its own transaction.
///
/// A transaction still active when the call returns is suspended by the
/// container and resumed on the next call to the same instance.
pub struct UserTransaction {
    manager: Arc<TransactionManager>,
    current: Mutex<Option<Arc<Transaction>>>,
}

impl UserTransaction {
    /// Creates a handle with no transaction.
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        Self {
            manager,
            current: Mutex::new(None),
        }
    }

    /// Starts a transaction. Nested transactions are not supported.
    pub fn begin(&self) -> Result<Arc<Transaction>, TransactionError> {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|tx| tx.is_active()) {
            return Err(TransactionError::NestedNotSupported);
        }
        let tx = self.manager.begin();
        *current = Some(Arc::clone(&tx));
        Ok(tx)
    }

    /// Commits the current transaction.
    pub fn commit(&self) -> Result<(), TransactionError> {
        let tx = self.take()?;
        tx.commit()
    }

    /// Rolls back the current transaction.
    pub fn rollback(&self) -> Result<(), TransactionError> {
        let tx = self.take()?;
        tx.rollback()
    }

    /// Marks the current transaction rollback-only.
    pub fn set_rollback_only(&self) -> Result<(), TransactionError> {
        let current = self.current.lock();
        let tx = current.as_ref().ok_or(TransactionError::NoTransaction)?;
        tx.set_rollback_only("marked by bean");
        Ok(())
    }

    /// Status of the current transaction, if any.
    pub fn status(&self) -> Option<Status> {
        self.current.lock().as_ref().map(|tx| tx.status())
    }

    /// Current transaction, if any.
    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.current.lock().clone()
    }

    /// Detaches an active transaction so it can outlive the call.
    pub fn suspend(&self) -> Option<Arc<Transaction>> {
        self.current.lock().take().filter(|tx| tx.is_active())
    }

    /// Reattaches a suspended transaction.
    pub fn resume(&self, transaction: Arc<Transaction>) {
        *self.current.lock() = Some(transaction);
    }

    fn take(&self) -> Result<Arc<Transaction>, TransactionError> {
        self.current
            .lock()
            .take()
            .ok_or(TransactionError::NoTransaction)
    }
}

impl fmt::Debug for UserTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserTransaction")
            .field("current", &self.current.lock().as_ref().map(|tx| tx.id()))
            .finish()
    }
}
