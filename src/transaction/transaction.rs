use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::storage::page::RecordId;
use crate::transaction::lock_manager::LockMode;

pub type TransactionId = u64;
pub const INVALID_TRANSACTION_ID: TransactionId = 0;

pub type TableOid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why a transaction was aborted by the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    UpgradeConflict,
    LockSharedOnReadUncommitted,
    TableLockNotPresent,
    AttemptedIntentionLockOnRow,
    TableUnlockedBeforeUnlockingRows,
    AttemptedUnlockButNoLockHeld,
    IncompatibleUpgrade,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            AbortReason::LockOnShrinking => "lock requested while in the shrinking phase",
            AbortReason::UpgradeConflict => {
                "another transaction is already waiting to upgrade its lock"
            }
            AbortReason::LockSharedOnReadUncommitted => {
                "shared locks are not allowed under READ_UNCOMMITTED"
            }
            AbortReason::TableLockNotPresent => {
                "row lock requested without the matching table lock"
            }
            AbortReason::AttemptedIntentionLockOnRow => "intention locks are not allowed on rows",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked while row locks are still held"
            }
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock requested but no lock is held",
            AbortReason::IncompatibleUpgrade => "requested lock upgrade is not allowed",
        };
        write!(f, "{}", message)
    }
}

/// Locks a transaction currently holds, one set per mode.
#[derive(Debug, Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

impl LockSets {
    fn table_set(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    lock_sets: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            lock_sets: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// The mode this transaction holds on a table, if any. A transaction
    /// holds at most one table lock mode per table.
    pub fn table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        let sets = self.lock_sets.lock();
        if sets.exclusive_tables.contains(&oid) {
            Some(LockMode::Exclusive)
        } else if sets.shared_intention_exclusive_tables.contains(&oid) {
            Some(LockMode::SharedIntentionExclusive)
        } else if sets.shared_tables.contains(&oid) {
            Some(LockMode::Shared)
        } else if sets.intention_exclusive_tables.contains(&oid) {
            Some(LockMode::IntentionExclusive)
        } else if sets.intention_shared_tables.contains(&oid) {
            Some(LockMode::IntentionShared)
        } else {
            None
        }
    }

    pub fn row_lock_mode(&self, oid: TableOid, rid: RecordId) -> Option<LockMode> {
        let sets = self.lock_sets.lock();
        if sets
            .exclusive_rows
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
        {
            Some(LockMode::Exclusive)
        } else if sets
            .shared_rows
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
        {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows.get(&oid).is_some_and(|rows| !rows.is_empty())
            || sets
                .exclusive_rows
                .get(&oid)
                .is_some_and(|rows| !rows.is_empty())
    }

    pub(crate) fn add_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set(mode).remove(&oid);
    }

    pub(crate) fn add_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => unreachable!("intention locks are rejected on rows"),
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => unreachable!("intention locks are rejected on rows"),
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
        }
    }

    /// Forgets every held lock. Used when the deadlock detector kills this
    /// transaction; the queues are scrubbed separately.
    pub(crate) fn clear_lock_sets(&self) {
        *self.lock_sets.lock() = LockSets::default();
    }

    pub fn held_table_locks(&self) -> Vec<(LockMode, TableOid)> {
        let sets = self.lock_sets.lock();
        let mut held = Vec::new();
        for (mode, set) in [
            (LockMode::Shared, &sets.shared_tables),
            (LockMode::Exclusive, &sets.exclusive_tables),
            (LockMode::IntentionShared, &sets.intention_shared_tables),
            (LockMode::IntentionExclusive, &sets.intention_exclusive_tables),
            (
                LockMode::SharedIntentionExclusive,
                &sets.shared_intention_exclusive_tables,
            ),
        ] {
            held.extend(set.iter().map(|oid| (mode, *oid)));
        }
        held
    }

    pub fn held_row_locks(&self) -> Vec<(LockMode, TableOid, RecordId)> {
        let sets = self.lock_sets.lock();
        let mut held = Vec::new();
        for (mode, rows) in [
            (LockMode::Shared, &sets.shared_rows),
            (LockMode::Exclusive, &sets.exclusive_rows),
        ] {
            for (oid, rids) in rows.iter() {
                held.extend(rids.iter().map(|rid| (mode, *oid, *rid)));
            }
        }
        held
    }
}
