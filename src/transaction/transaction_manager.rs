use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::VellumResult;
use crate::transaction::{
    IsolationLevel, LockManager, Transaction, TransactionId, TransactionState,
};

/// Hands out transaction ids and drives 2PL cleanup on commit/abort.
#[derive(Debug)]
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    lock_manager: Arc<LockManager>,
    active: DashMap<TransactionId, Arc<Transaction>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            lock_manager,
            active: DashMap::new(),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active.insert(txn_id, Arc::clone(&txn));
        debug!("txn {} began at {:?}", txn_id, isolation_level);
        txn
    }

    /// Commits and releases every lock, rows before tables.
    pub fn commit(&self, txn: &Arc<Transaction>) -> VellumResult<()> {
        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all_locks(txn)?;
        self.active.remove(&txn.id());
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Aborts and releases every lock. Also used to finish off deadlock
    /// victims, whose held sets the detector already cleared.
    pub fn abort(&self, txn: &Arc<Transaction>) -> VellumResult<()> {
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all_locks(txn)?;
        self.active.remove(&txn.id());
        debug!("txn {} aborted", txn.id());
        Ok(())
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }
}
