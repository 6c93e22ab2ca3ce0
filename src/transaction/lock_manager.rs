use dashmap::DashMap;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::background::{spawn_periodic_worker, WorkerHandle};
use crate::config::LockManagerConfig;
use crate::error::{VellumError, VellumResult};
use crate::storage::page::RecordId;
use crate::transaction::{
    AbortReason, IsolationLevel, TableOid, Transaction, TransactionId, TransactionState,
    INVALID_TRANSACTION_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

#[derive(Debug)]
struct LockRequest {
    id: u64,
    txn: Arc<Transaction>,
    mode: LockMode,
    oid: TableOid,
    rid: Option<RecordId>,
    granted: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    // insertion order is grant order: granted requests, then the upgrader
    // (if any), then waiters
    requests: VecDeque<LockRequest>,
    upgrading: TransactionId,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

/// Two-phase lock manager with multi-granularity table/row locks.
///
/// Each resource has a FIFO request queue guarded by its own mutex and woken
/// through its condition variable. Waiters block until every earlier request
/// in the queue is compatible or their transaction is aborted; an upgrade
/// re-enters the queue ahead of all waiters and at most one transaction may
/// be upgrading a queue at a time. A background pass builds the waits-for
/// graph and aborts the youngest transaction of every cycle.
#[derive(Debug)]
pub struct LockManager {
    table_lock_map: DashMap<TableOid, Arc<LockRequestQueue>>,
    row_lock_map: DashMap<RecordId, Arc<LockRequestQueue>>,
    next_request_id: AtomicU64,
    config: LockManagerConfig,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(LockManagerConfig::default())
    }
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        Self {
            table_lock_map: DashMap::new(),
            row_lock_map: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            config,
        }
    }

    /// Spawns the deadlock detection loop. The worker stops when the handle
    /// is dropped.
    pub fn start_deadlock_detection(self: &Arc<Self>) -> Option<WorkerHandle> {
        let lock_manager = Arc::clone(self);
        spawn_periodic_worker(
            "deadlock-detector",
            self.config.deadlock_detection_interval,
            move || lock_manager.detect_and_break_deadlocks(),
        )
    }

    /// Acquires a table lock, blocking until granted. Returns false when the
    /// transaction was aborted while waiting (deadlock victim); protocol
    /// violations abort the transaction and surface as errors.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> VellumResult<bool> {
        self.check_lock_allowed(txn, mode)?;
        if let Some(held) = txn.table_lock_mode(oid) {
            if held == mode {
                return Ok(true);
            }
            self.check_upgrade_allowed(txn, held, mode)?;
        }
        let queue = self.table_queue(oid);
        self.lock_resource(txn, mode, oid, None, &queue)
    }

    /// Acquires a row lock (S or X only); the matching table intention lock
    /// must already be held.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> VellumResult<bool> {
        if !matches!(mode, LockMode::Shared | LockMode::Exclusive) {
            return self.abort(txn, AbortReason::AttemptedIntentionLockOnRow);
        }
        self.check_lock_allowed(txn, mode)?;
        if let Some(held) = txn.row_lock_mode(oid, rid) {
            if held == mode {
                return Ok(true);
            }
            self.check_upgrade_allowed(txn, held, mode)?;
        }

        let table_mode = txn.table_lock_mode(oid);
        let table_lock_ok = match mode {
            LockMode::Exclusive => matches!(
                table_mode,
                Some(
                    LockMode::Exclusive
                        | LockMode::IntentionExclusive
                        | LockMode::SharedIntentionExclusive
                )
            ),
            _ => table_mode.is_some(),
        };
        if !table_lock_ok {
            return self.abort(txn, AbortReason::TableLockNotPresent);
        }

        let queue = self.row_queue(rid);
        self.lock_resource(txn, mode, oid, Some(rid), &queue)
    }

    /// Releases the transaction's table lock, applying the isolation level's
    /// phase transition. All row locks on the table must be gone already.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> VellumResult<bool> {
        if txn.holds_row_locks_on(oid) {
            return self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows);
        }
        let Some(held) = txn.table_lock_mode(oid) else {
            return self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld);
        };
        let Some(queue) = self.table_lock_map.get(&oid).map(|q| Arc::clone(&q)) else {
            return self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld);
        };

        let removed = {
            let mut state = queue.state.lock();
            let before = state.requests.len();
            state
                .requests
                .retain(|req| !(req.txn.id() == txn.id() && req.granted));
            state.requests.len() != before
        };
        if !removed {
            return self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld);
        }
        self.update_state_on_unlock(txn, held)?;
        txn.remove_table_lock(held, oid);
        queue.condvar.notify_all();
        trace!("txn {} unlocked table {} ({:?})", txn.id(), oid, held);
        Ok(true)
    }

    /// Releases a row lock. With `force` the isolation level's phase
    /// transition is skipped (2PL cleanup on commit/abort).
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: RecordId,
        force: bool,
    ) -> VellumResult<bool> {
        let Some(held) = txn.row_lock_mode(oid, rid) else {
            return self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld);
        };
        let Some(queue) = self.row_lock_map.get(&rid).map(|q| Arc::clone(&q)) else {
            return self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld);
        };

        let removed = {
            let mut state = queue.state.lock();
            let before = state.requests.len();
            state
                .requests
                .retain(|req| !(req.txn.id() == txn.id() && req.granted && req.rid == Some(rid)));
            state.requests.len() != before
        };
        if !removed {
            return self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld);
        }
        if !force {
            self.update_state_on_unlock(txn, held)?;
        }
        txn.remove_row_lock(held, oid, rid);
        queue.condvar.notify_all();
        trace!("txn {} unlocked row {} ({:?})", txn.id(), rid, held);
        Ok(true)
    }

    /// Releases everything the transaction still holds, rows before tables.
    /// Used by commit/abort; phase transitions no longer apply there.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) -> VellumResult<()> {
        for (_, oid, rid) in txn.held_row_locks() {
            self.unlock_row(txn, oid, rid, true)?;
        }
        for (_, oid) in txn.held_table_locks() {
            self.unlock_table(txn, oid)?;
        }
        Ok(())
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        Arc::clone(
            &self
                .table_lock_map
                .entry(oid)
                .or_insert_with(|| Arc::new(LockRequestQueue::default())),
        )
    }

    fn row_queue(&self, rid: RecordId) -> Arc<LockRequestQueue> {
        Arc::clone(
            &self
                .row_lock_map
                .entry(rid)
                .or_insert_with(|| Arc::new(LockRequestQueue::default())),
        )
    }

    fn lock_resource(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Option<RecordId>,
        queue: &Arc<LockRequestQueue>,
    ) -> VellumResult<bool> {
        let txn_id = txn.id();
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let mut state = queue.state.lock();

        let held = match rid {
            None => txn.table_lock_mode(oid),
            Some(rid) => txn.row_lock_mode(oid, rid),
        };
        if let Some(held_mode) = held {
            // upgrade: drop the old granted request and cut ahead of the
            // waiters; a queue admits one upgrader at a time
            if state.upgrading != INVALID_TRANSACTION_ID {
                drop(state);
                return self.abort(txn, AbortReason::UpgradeConflict);
            }
            state
                .requests
                .retain(|req| !(req.txn.id() == txn_id && req.granted));
            match rid {
                None => txn.remove_table_lock(held_mode, oid),
                Some(rid) => txn.remove_row_lock(held_mode, oid, rid),
            }
            queue.condvar.notify_all();

            state.upgrading = txn_id;
            let first_waiter = state
                .requests
                .iter()
                .position(|req| !req.granted)
                .unwrap_or(state.requests.len());
            state.requests.insert(
                first_waiter,
                LockRequest {
                    id: request_id,
                    txn: Arc::clone(txn),
                    mode,
                    oid,
                    rid,
                    granted: false,
                },
            );
        } else {
            state.requests.push_back(LockRequest {
                id: request_id,
                txn: Arc::clone(txn),
                mode,
                oid,
                rid,
                granted: false,
            });
        }

        // wait until the request is grantable or the transaction dies
        loop {
            if txn.state() == TransactionState::Aborted {
                break;
            }
            if Self::grantable(&state.requests, request_id) {
                break;
            }
            trace!("txn {} waiting for {:?} on {:?}/{:?}", txn_id, mode, oid, rid);
            queue.condvar.wait(&mut state);
        }

        if state.upgrading == txn_id {
            state.upgrading = INVALID_TRANSACTION_ID;
        }

        if txn.state() == TransactionState::Aborted {
            state.requests.retain(|req| req.id != request_id);
            drop(state);
            queue.condvar.notify_all();
            return Ok(false);
        }

        if let Some(req) = state.requests.iter_mut().find(|req| req.id == request_id) {
            req.granted = true;
        }
        match rid {
            None => txn.add_table_lock(mode, oid),
            Some(rid) => txn.add_row_lock(mode, oid, rid),
        }
        trace!("txn {} granted {:?} on {:?}/{:?}", txn_id, mode, oid, rid);
        Ok(true)
    }

    /// A request may be granted when every earlier request in the queue is
    /// compatible with it; an earlier request of the same transaction and
    /// mode does not block.
    fn grantable(requests: &VecDeque<LockRequest>, request_id: u64) -> bool {
        let Some(position) = requests.iter().position(|req| req.id == request_id) else {
            return false;
        };
        let request = &requests[position];
        for earlier in requests.iter().take(position) {
            if earlier.txn.id() == request.txn.id() && earlier.mode == request.mode {
                continue;
            }
            if !Self::compatible(request.mode, earlier.mode) {
                return false;
            }
        }
        true
    }

    fn compatible(a: LockMode, b: LockMode) -> bool {
        use LockMode::*;
        match (a, b) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    fn check_lock_allowed(&self, txn: &Arc<Transaction>, mode: LockMode) -> VellumResult<()> {
        let state = txn.state();
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if state == TransactionState::Shrinking {
                    return self.abort(txn, AbortReason::LockOnShrinking).map(|_| ());
                }
            }
            IsolationLevel::ReadCommitted => {
                if state == TransactionState::Shrinking
                    && !matches!(mode, LockMode::Shared | LockMode::IntentionShared)
                {
                    return self.abort(txn, AbortReason::LockOnShrinking).map(|_| ());
                }
            }
            IsolationLevel::ReadUncommitted => {
                if !matches!(mode, LockMode::Exclusive | LockMode::IntentionExclusive) {
                    return self
                        .abort(txn, AbortReason::LockSharedOnReadUncommitted)
                        .map(|_| ());
                }
                if state == TransactionState::Shrinking {
                    return self.abort(txn, AbortReason::LockOnShrinking).map(|_| ());
                }
            }
        }
        Ok(())
    }

    /// The strict upgrade lattice: IS -> {S, X, IX, SIX}, S -> {X, SIX},
    /// IX -> {X, SIX}, SIX -> X.
    fn check_upgrade_allowed(
        &self,
        txn: &Arc<Transaction>,
        held: LockMode,
        requested: LockMode,
    ) -> VellumResult<()> {
        use LockMode::*;
        let allowed = matches!(
            (held, requested),
            (IntentionShared, Shared)
                | (IntentionShared, Exclusive)
                | (IntentionShared, IntentionExclusive)
                | (IntentionShared, SharedIntentionExclusive)
                | (Shared, Exclusive)
                | (Shared, SharedIntentionExclusive)
                | (IntentionExclusive, Exclusive)
                | (IntentionExclusive, SharedIntentionExclusive)
                | (SharedIntentionExclusive, Exclusive)
        );
        if allowed {
            Ok(())
        } else {
            self.abort(txn, AbortReason::IncompatibleUpgrade).map(|_| ())
        }
    }

    fn update_state_on_unlock(&self, txn: &Arc<Transaction>, mode: LockMode) -> VellumResult<()> {
        let growing = txn.state() == TransactionState::Growing;
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if growing && matches!(mode, LockMode::Shared | LockMode::Exclusive) {
                    txn.set_state(TransactionState::Shrinking);
                }
            }
            IsolationLevel::ReadCommitted => {
                if growing && mode == LockMode::Exclusive {
                    txn.set_state(TransactionState::Shrinking);
                }
            }
            IsolationLevel::ReadUncommitted => {
                if mode == LockMode::Shared {
                    return self
                        .abort(txn, AbortReason::LockSharedOnReadUncommitted)
                        .map(|_| ());
                }
                if growing && mode == LockMode::Exclusive {
                    txn.set_state(TransactionState::Shrinking);
                }
            }
        }
        Ok(())
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> VellumResult<bool> {
        txn.set_state(TransactionState::Aborted);
        Err(VellumError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        })
    }

    /// One detection pass: abort the youngest transaction of every waits-for
    /// cycle until the graph is acyclic.
    pub fn detect_and_break_deadlocks(&self) {
        loop {
            let (graph, txns) = self.build_waits_for_graph();
            let Some(cycle) = Self::find_cycle(&graph) else {
                return;
            };
            let victim_id = *cycle.iter().max().expect("cycles are never empty");
            let Some(victim) = txns.get(&victim_id) else {
                return;
            };
            warn!(
                "deadlock on transactions {:?}; aborting youngest txn {}",
                cycle, victim_id
            );
            self.abort_victim(victim);
        }
    }

    /// Edge u -> g for every ungranted request u stuck behind an incompatible
    /// granted request g of another transaction.
    fn build_waits_for_graph(
        &self,
    ) -> (
        BTreeMap<TransactionId, BTreeSet<TransactionId>>,
        HashMap<TransactionId, Arc<Transaction>>,
    ) {
        let mut graph: BTreeMap<TransactionId, BTreeSet<TransactionId>> = BTreeMap::new();
        let mut txns: HashMap<TransactionId, Arc<Transaction>> = HashMap::new();
        let collect = |queue: &Arc<LockRequestQueue>,
                       graph: &mut BTreeMap<TransactionId, BTreeSet<TransactionId>>,
                       txns: &mut HashMap<TransactionId, Arc<Transaction>>| {
            let state = queue.state.lock();
            for waiter in state.requests.iter().filter(|req| !req.granted) {
                for granted in state.requests.iter().filter(|req| req.granted) {
                    if waiter.txn.id() == granted.txn.id()
                        || Self::compatible(waiter.mode, granted.mode)
                    {
                        continue;
                    }
                    graph
                        .entry(waiter.txn.id())
                        .or_default()
                        .insert(granted.txn.id());
                    txns.insert(waiter.txn.id(), Arc::clone(&waiter.txn));
                    txns.insert(granted.txn.id(), Arc::clone(&granted.txn));
                }
            }
        };
        for entry in self.table_lock_map.iter() {
            collect(entry.value(), &mut graph, &mut txns);
        }
        for entry in self.row_lock_map.iter() {
            collect(entry.value(), &mut graph, &mut txns);
        }
        (graph, txns)
    }

    /// Deterministic DFS: start nodes in ascending id order, neighbours in
    /// ascending order. Returns the node set of the first cycle found.
    fn find_cycle(
        graph: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
    ) -> Option<Vec<TransactionId>> {
        fn dfs(
            graph: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
            node: TransactionId,
            path: &mut Vec<TransactionId>,
            explored: &mut BTreeSet<TransactionId>,
        ) -> Option<Vec<TransactionId>> {
            if let Some(position) = path.iter().position(|txn_id| *txn_id == node) {
                return Some(path[position..].to_vec());
            }
            if !explored.insert(node) {
                return None;
            }
            path.push(node);
            if let Some(neighbours) = graph.get(&node) {
                for next in neighbours {
                    if let Some(cycle) = dfs(graph, *next, path, explored) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            None
        }

        let mut explored = BTreeSet::new();
        for start in graph.keys() {
            let mut path = Vec::new();
            if let Some(cycle) = dfs(graph, *start, &mut path, &mut explored) {
                return Some(cycle);
            }
        }
        None
    }

    /// Kills a deadlock victim: granted requests disappear from every queue,
    /// held sets are cleared, and all waiters are woken so the victim's own
    /// blocked request removes itself.
    fn abort_victim(&self, victim: &Arc<Transaction>) {
        victim.set_state(TransactionState::Aborted);
        victim.clear_lock_sets();
        let victim_id = victim.id();
        let scrub = |queue: &Arc<LockRequestQueue>| {
            let mut state = queue.state.lock();
            state
                .requests
                .retain(|req| !(req.txn.id() == victim_id && req.granted));
            queue.condvar.notify_all();
        };
        for entry in self.table_lock_map.iter() {
            scrub(entry.value());
        }
        for entry in self.row_lock_map.iter() {
            scrub(entry.value());
        }
    }

    #[cfg(test)]
    pub(crate) fn granted_modes(&self, oid: TableOid) -> Vec<(TransactionId, LockMode)> {
        match self.table_lock_map.get(&oid) {
            Some(queue) => {
                let state = queue.state.lock();
                state
                    .requests
                    .iter()
                    .filter(|req| req.granted)
                    .map(|req| (req.txn.id(), req.mode))
                    .collect()
            }
            None => Vec::new(),
        }
    }
}
