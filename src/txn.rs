//! Transactions under strict two-phase locking.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::lock_manager::LockManager;
use crate::{RowId, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Why a lock operation aborted its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockSharedOnReadUncommitted,
    LockOnShrinking,
    UpgradeConflict,
    Deadlock,
}

/// Abort surfaced as a result variant; the transaction manager reacts by
/// releasing everything the transaction holds.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason:?}")]
pub struct TxnAbortError {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

/// A transaction. State and lock sets sit behind their own locks so the
/// deadlock detector can abort a transaction its own thread is blocked
/// in.
pub struct Txn {
    txn_id: TxnId,
    isolation: IsolationLevel,
    state: Mutex<TxnState>,
    shared_lock_set: Mutex<HashSet<RowId>>,
    exclusive_lock_set: Mutex<HashSet<RowId>>,
}

impl Txn {
    pub fn new(txn_id: TxnId, isolation: IsolationLevel) -> Self {
        Self {
            txn_id,
            isolation,
            state: Mutex::new(TxnState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TxnState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn shared_locked(&self, rid: RowId) -> bool {
        self.shared_lock_set.lock().unwrap().contains(&rid)
    }

    pub fn exclusive_locked(&self, rid: RowId) -> bool {
        self.exclusive_lock_set.lock().unwrap().contains(&rid)
    }

    pub fn shared_lock_set(&self) -> Vec<RowId> {
        self.shared_lock_set.lock().unwrap().iter().copied().collect()
    }

    pub fn exclusive_lock_set(&self) -> Vec<RowId> {
        self.exclusive_lock_set.lock().unwrap().iter().copied().collect()
    }

    pub(crate) fn add_shared(&self, rid: RowId) {
        self.shared_lock_set.lock().unwrap().insert(rid);
    }

    pub(crate) fn add_exclusive(&self, rid: RowId) {
        self.exclusive_lock_set.lock().unwrap().insert(rid);
    }

    pub(crate) fn promote_to_exclusive(&self, rid: RowId) {
        self.shared_lock_set.lock().unwrap().remove(&rid);
        self.exclusive_lock_set.lock().unwrap().insert(rid);
    }

    pub(crate) fn remove_lock(&self, rid: RowId) {
        self.shared_lock_set.lock().unwrap().remove(&rid);
        self.exclusive_lock_set.lock().unwrap().remove(&rid);
    }

    pub(crate) fn clear_lock_sets(&self) {
        self.shared_lock_set.lock().unwrap().clear();
        self.exclusive_lock_set.lock().unwrap().clear();
    }
}

/// Vends transactions and drives their terminal transitions. Both
/// commit and abort hand every held lock back to the lock manager.
pub struct TxnManager {
    next_txn_id: AtomicU32,
    txns: Mutex<HashMap<TxnId, Arc<Txn>>>,
    lock_manager: Arc<LockManager>,
}

impl TxnManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Arc<Self> {
        let manager = Arc::new(Self {
            next_txn_id: AtomicU32::new(0),
            txns: Mutex::new(HashMap::new()),
            lock_manager,
        });
        manager.lock_manager.set_txn_manager(&manager);
        manager
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Arc<Txn> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Txn::new(txn_id, isolation));
        self.txns.lock().unwrap().insert(txn_id, txn.clone());
        crate::granite_debug_log!("[TxnManager::begin] started txn {txn_id}");
        txn
    }

    pub fn get_txn(&self, txn_id: TxnId) -> Option<Arc<Txn>> {
        self.txns.lock().unwrap().get(&txn_id).cloned()
    }

    pub fn commit(&self, txn: &Txn) {
        txn.set_state(TxnState::Committed);
        self.lock_manager.release_all(txn);
        self.txns.lock().unwrap().remove(&txn.txn_id());
        crate::granite_debug_log!("[TxnManager::commit] committed txn {}", txn.txn_id());
    }

    pub fn abort(&self, txn: &Txn) {
        txn.set_state(TxnState::Aborted);
        self.lock_manager.release_all(txn);
        self.txns.lock().unwrap().remove(&txn.txn_id());
        crate::granite_debug_log!("[TxnManager::abort] aborted txn {}", txn.txn_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_lifecycle() {
        let lock_manager = Arc::new(LockManager::new(std::time::Duration::from_millis(50)));
        let tm = TxnManager::new(lock_manager);

        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        let t2 = tm.begin(IsolationLevel::ReadCommitted);
        assert_eq!(t1.txn_id(), 0);
        assert_eq!(t2.txn_id(), 1);
        assert_eq!(t1.state(), TxnState::Growing);

        tm.commit(&t1);
        assert_eq!(t1.state(), TxnState::Committed);
        assert!(tm.get_txn(0).is_none());

        tm.abort(&t2);
        assert_eq!(t2.state(), TxnState::Aborted);
        assert!(tm.get_txn(1).is_none());
    }
}
