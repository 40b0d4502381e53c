//! Row-level shared/exclusive locking with FIFO queues, upgrades, and
//! background deadlock detection over a wait-for graph.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::txn::{AbortReason, IsolationLevel, Txn, TxnAbortError, TxnManager, TxnState};
use crate::{RowId, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: Option<LockMode>,
}

/// One request queue per row. All condvars pair with the single
/// lock-table mutex; per-queue condvars bound who gets woken.
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    sharing_cnt: u32,
    is_writing: bool,
    upgrading_txn: Option<TxnId>,
    cvar: Arc<Condvar>,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            sharing_cnt: 0,
            is_writing: false,
            upgrading_txn: None,
            cvar: Arc::new(Condvar::new()),
        }
    }

    fn find(&self, txn_id: TxnId) -> Option<usize> {
        self.requests.iter().position(|r| r.txn_id == txn_id)
    }

    fn is_upgrading(&self) -> bool {
        self.upgrading_txn.is_some()
    }
}

struct LockTable {
    queues: HashMap<RowId, LockRequestQueue>,
    /// `waits_for[t]` is the set of transactions `t` is blocked behind.
    waits_for: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

/// The lock manager. Grants follow the queue in FIFO order subject to
/// mode compatibility; a background thread rebuilds the wait-for graph
/// and aborts one victim per detected cycle.
pub struct LockManager {
    latch: Mutex<LockTable>,
    txn_manager: Mutex<Weak<TxnManager>>,
    detection_interval: Duration,
    stop_detection: Arc<AtomicBool>,
    detection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(detection_interval: Duration) -> Self {
        Self {
            latch: Mutex::new(LockTable {
                queues: HashMap::new(),
                waits_for: BTreeMap::new(),
            }),
            txn_manager: Mutex::new(Weak::new()),
            detection_interval,
            stop_detection: Arc::new(AtomicBool::new(false)),
            detection_handle: Mutex::new(None),
        }
    }

    /// Installs the back-reference the detection thread aborts victims
    /// through.
    pub fn set_txn_manager(&self, txn_manager: &Arc<TxnManager>) {
        *self.txn_manager.lock().unwrap() = Arc::downgrade(txn_manager);
    }

    /// Takes a shared lock, blocking while a writer or an upgrader is
    /// ahead. Read-uncommitted transactions must not take shared locks.
    pub fn lock_shared(&self, txn: &Txn, rid: RowId) -> Result<bool, TxnAbortError> {
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            txn.set_state(TxnState::Aborted);
            return Err(TxnAbortError {
                txn_id: txn.txn_id(),
                reason: AbortReason::LockSharedOnReadUncommitted,
            });
        }
        if txn.state() != TxnState::Growing {
            txn.set_state(TxnState::Aborted);
            return Err(TxnAbortError {
                txn_id: txn.txn_id(),
                reason: AbortReason::LockOnShrinking,
            });
        }
        let mut table = self.latch.lock().unwrap();
        let queue = table.queues.entry(rid).or_insert_with(LockRequestQueue::new);
        let cvar = queue.cvar.clone();
        queue.requests.push_back(LockRequest {
            txn_id: txn.txn_id(),
            mode: LockMode::Shared,
            granted: None,
        });
        loop {
            let Some(queue) = table.queues.get_mut(&rid) else {
                return Err(self.aborted_while_waiting(txn));
            };
            let Some(at) = queue.find(txn.txn_id()) else {
                return Err(self.aborted_while_waiting(txn));
            };
            if !queue.is_writing && !queue.is_upgrading() {
                queue.requests[at].granted = Some(LockMode::Shared);
                queue.sharing_cnt += 1;
                queue.cvar.notify_all();
                txn.add_shared(rid);
                crate::granite_debug_log!(
                    "[LockManager::lock_shared] granted S on {rid:?} to txn {}",
                    txn.txn_id()
                );
                return Ok(true);
            }
            table = cvar.wait(table).unwrap();
        }
    }

    /// Takes an exclusive lock, blocking while anyone else holds or is
    /// upgrading.
    pub fn lock_exclusive(&self, txn: &Txn, rid: RowId) -> Result<bool, TxnAbortError> {
        if txn.state() != TxnState::Growing {
            txn.set_state(TxnState::Aborted);
            return Err(TxnAbortError {
                txn_id: txn.txn_id(),
                reason: AbortReason::LockOnShrinking,
            });
        }
        let mut table = self.latch.lock().unwrap();
        let queue = table.queues.entry(rid).or_insert_with(LockRequestQueue::new);
        let cvar = queue.cvar.clone();
        queue.requests.push_back(LockRequest {
            txn_id: txn.txn_id(),
            mode: LockMode::Exclusive,
            granted: None,
        });
        loop {
            let Some(queue) = table.queues.get_mut(&rid) else {
                return Err(self.aborted_while_waiting(txn));
            };
            let Some(at) = queue.find(txn.txn_id()) else {
                return Err(self.aborted_while_waiting(txn));
            };
            if !queue.is_writing && !queue.is_upgrading() && queue.sharing_cnt == 0 {
                queue.requests[at].granted = Some(LockMode::Exclusive);
                queue.is_writing = true;
                queue.cvar.notify_all();
                txn.add_exclusive(rid);
                crate::granite_debug_log!(
                    "[LockManager::lock_exclusive] granted X on {rid:?} to txn {}",
                    txn.txn_id()
                );
                return Ok(true);
            }
            table = cvar.wait(table).unwrap();
        }
    }

    /// Upgrades a held shared lock to exclusive. Only one upgrader may
    /// wait per row; a second one aborts with `UpgradeConflict`. Returns
    /// `Ok(false)` when the transaction was swept out of the queue while
    /// it waited.
    pub fn lock_upgrade(&self, txn: &Txn, rid: RowId) -> Result<bool, TxnAbortError> {
        if txn.state() != TxnState::Growing {
            txn.set_state(TxnState::Aborted);
            return Err(TxnAbortError {
                txn_id: txn.txn_id(),
                reason: AbortReason::LockOnShrinking,
            });
        }
        let mut table = self.latch.lock().unwrap();
        let queue = table.queues.entry(rid).or_insert_with(LockRequestQueue::new);
        if queue.is_upgrading() {
            txn.set_state(TxnState::Aborted);
            return Err(TxnAbortError {
                txn_id: txn.txn_id(),
                reason: AbortReason::UpgradeConflict,
            });
        }
        match queue.find(txn.txn_id()) {
            // Only a held shared lock can be upgraded.
            Some(at) if queue.requests[at].mode == LockMode::Shared => {}
            _ => return Ok(false),
        }
        let cvar = queue.cvar.clone();
        queue.upgrading_txn = Some(txn.txn_id());
        loop {
            let Some(queue) = table.queues.get_mut(&rid) else {
                return Ok(false);
            };
            let Some(at) = queue.find(txn.txn_id()) else {
                // Aborted while waiting; hand the queue back.
                queue.upgrading_txn = None;
                queue.cvar.notify_all();
                return Ok(false);
            };
            if !queue.is_writing && queue.sharing_cnt <= 1 {
                let request = &mut queue.requests[at];
                request.mode = LockMode::Exclusive;
                request.granted = Some(LockMode::Exclusive);
                queue.sharing_cnt -= 1;
                queue.is_writing = true;
                queue.upgrading_txn = None;
                queue.cvar.notify_all();
                txn.promote_to_exclusive(rid);
                crate::granite_debug_log!(
                    "[LockManager::lock_upgrade] upgraded {rid:?} for txn {}",
                    txn.txn_id()
                );
                return Ok(true);
            }
            table = cvar.wait(table).unwrap();
        }
    }

    /// Releases one lock. The first unlock moves the transaction into
    /// its shrinking phase.
    pub fn unlock(&self, txn: &Txn, rid: RowId) -> bool {
        let mut table = self.latch.lock().unwrap();
        let Some(queue) = table.queues.get_mut(&rid) else {
            return false;
        };
        let Some(at) = queue.find(txn.txn_id()) else {
            return false;
        };
        match queue.requests[at].granted {
            Some(LockMode::Shared) => queue.sharing_cnt -= 1,
            Some(LockMode::Exclusive) => queue.is_writing = false,
            None => {}
        }
        queue.requests.remove(at);
        queue.cvar.notify_all();
        if queue.requests.is_empty() {
            table.queues.remove(&rid);
        }
        if txn.state() == TxnState::Growing {
            txn.set_state(TxnState::Shrinking);
        }
        txn.remove_lock(rid);
        true
    }

    /// Sweeps every queue for the transaction's requests, granted or
    /// waiting, and wakes the affected queues. Used by commit and abort.
    pub fn release_all(&self, txn: &Txn) {
        let txn_id = txn.txn_id();
        let mut table = self.latch.lock().unwrap();
        table.queues.retain(|_, queue| {
            let Some(at) = queue.find(txn_id) else {
                return true;
            };
            match queue.requests[at].granted {
                Some(LockMode::Shared) => queue.sharing_cnt -= 1,
                Some(LockMode::Exclusive) => queue.is_writing = false,
                None => {}
            }
            if queue.upgrading_txn == Some(txn_id) {
                queue.upgrading_txn = None;
            }
            queue.requests.remove(at);
            queue.cvar.notify_all();
            !queue.requests.is_empty()
        });
        table.waits_for.remove(&txn_id);
        for edges in table.waits_for.values_mut() {
            edges.remove(&txn_id);
        }
        txn.clear_lock_sets();
    }

    /// Spawns the background cycle-detection thread. The thread holds a
    /// weak reference so dropping the manager shuts it down.
    pub fn start_deadlock_detection(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        let stop = Arc::clone(&self.stop_detection);
        let handle = thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let Some(manager) = this.upgrade() else {
                    break;
                };
                manager.run_detection_round();
                let interval = manager.detection_interval;
                drop(manager);
                thread::sleep(interval);
            }
        });
        *self.detection_handle.lock().unwrap() = Some(handle);
    }

    /// One detection round: rebuild the graph from the queues, abort the
    /// newest transaction of the first cycle found, drop its node.
    fn run_detection_round(&self) {
        let victim = {
            let mut table = self.latch.lock().unwrap();
            Self::rebuild_wait_for_graph(&mut table);
            Self::find_cycle_victim(&table.waits_for)
        };
        let Some(victim) = victim else {
            return;
        };
        let Some(txn_manager) = self.txn_manager.lock().unwrap().upgrade() else {
            return;
        };
        let Some(txn) = txn_manager.get_txn(victim) else {
            return;
        };
        crate::granite_debug_log!("[LockManager] deadlock victim: txn {victim}");
        // Aborting sweeps the victim's requests out of every queue,
        // wakes its waiters, and deletes its node from the graph.
        txn_manager.abort(&txn);
    }

    /// Every later requester in a queue waits for every earlier one.
    fn rebuild_wait_for_graph(table: &mut LockTable) {
        table.waits_for.clear();
        let mut edges: Vec<(TxnId, TxnId)> = Vec::new();
        for queue in table.queues.values() {
            for (j, later) in queue.requests.iter().enumerate() {
                for earlier in queue.requests.iter().take(j) {
                    if earlier.txn_id != later.txn_id {
                        edges.push((later.txn_id, earlier.txn_id));
                    }
                }
            }
        }
        for (waiter, holder) in edges {
            table.waits_for.entry(waiter).or_default().insert(holder);
        }
    }

    /// Iterative DFS, always exploring the lowest transaction id first.
    /// On a cycle, the victim is the transaction whose outgoing edge
    /// closes back onto the path.
    fn find_cycle_victim(waits_for: &BTreeMap<TxnId, BTreeSet<TxnId>>) -> Option<TxnId> {
        let mut explored: BTreeSet<TxnId> = BTreeSet::new();
        for &start in waits_for.keys() {
            if explored.contains(&start) {
                continue;
            }
            let mut path: Vec<TxnId> = vec![start];
            let mut on_path: BTreeSet<TxnId> = BTreeSet::new();
            on_path.insert(start);
            // Per-node cursor over the sorted neighbor list.
            let mut cursors: Vec<Vec<TxnId>> = vec![Self::neighbors(waits_for, start)];
            while let Some(neighbors) = cursors.last_mut() {
                let node = *path.last().unwrap();
                let Some(next) = neighbors.first().copied() else {
                    explored.insert(node);
                    on_path.remove(&node);
                    path.pop();
                    cursors.pop();
                    continue;
                };
                neighbors.remove(0);
                if on_path.contains(&next) {
                    return Some(node);
                }
                if explored.contains(&next) {
                    continue;
                }
                path.push(next);
                on_path.insert(next);
                cursors.push(Self::neighbors(waits_for, next));
            }
        }
        None
    }

    fn neighbors(waits_for: &BTreeMap<TxnId, BTreeSet<TxnId>>, node: TxnId) -> Vec<TxnId> {
        waits_for
            .get(&node)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the wait-for edges, for introspection and tests.
    pub fn wait_for_edges(&self) -> Vec<(TxnId, TxnId)> {
        let mut table = self.latch.lock().unwrap();
        Self::rebuild_wait_for_graph(&mut table);
        table
            .waits_for
            .iter()
            .flat_map(|(&waiter, holders)| holders.iter().map(move |&h| (waiter, h)))
            .collect()
    }

    fn aborted_while_waiting(&self, txn: &Txn) -> TxnAbortError {
        txn.set_state(TxnState::Aborted);
        TxnAbortError {
            txn_id: txn.txn_id(),
            reason: AbortReason::Deadlock,
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.stop_detection.store(true, Ordering::SeqCst);
        if let Some(handle) = self.detection_handle.lock().unwrap().take() {
            // The final strong reference can die on the detection thread
            // itself; joining there would deadlock.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
