//! ARIES-style recovery over a logical key/value image.
//!
//! Log records capture operations as key/value pairs rather than page
//! images; the redo/undo structure is the interesting part and survives
//! the simplification. Records chain per transaction through `prev_lsn`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{Lsn, TxnId, INVALID_LSN};

pub type KvDatabase = HashMap<String, i32>;
/// Active-transaction table: each live transaction's latest LSN.
pub type ActiveTxnTable = HashMap<TxnId, Lsn>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecBody {
    Begin,
    Commit,
    Abort,
    Insert { key: String, val: i32 },
    Delete { key: String, val: i32 },
    Update {
        old_key: String,
        old_val: i32,
        new_key: String,
        new_val: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRec {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub body: LogRecBody,
}

/// Owns the log sequence: the next LSN and each transaction's previous
/// LSN, so records form per-transaction back-chains.
#[derive(Debug, Default)]
pub struct LogState {
    next_lsn: Lsn,
    prev_lsn_map: HashMap<TxnId, Lsn>,
}

impl LogState {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&mut self, txn_id: TxnId, body: LogRecBody) -> LogRec {
        let lsn = self.next_lsn + 1;
        self.next_lsn = lsn;
        let prev_lsn = self.prev_lsn_map.insert(txn_id, lsn).unwrap_or(INVALID_LSN);
        LogRec {
            lsn,
            txn_id,
            prev_lsn,
            body,
        }
    }

    pub fn begin_log(&mut self, txn_id: TxnId) -> LogRec {
        self.append(txn_id, LogRecBody::Begin)
    }

    pub fn commit_log(&mut self, txn_id: TxnId) -> LogRec {
        self.append(txn_id, LogRecBody::Commit)
    }

    pub fn abort_log(&mut self, txn_id: TxnId) -> LogRec {
        self.append(txn_id, LogRecBody::Abort)
    }

    pub fn insert_log(&mut self, txn_id: TxnId, key: &str, val: i32) -> LogRec {
        self.append(
            txn_id,
            LogRecBody::Insert {
                key: key.to_string(),
                val,
            },
        )
    }

    pub fn delete_log(&mut self, txn_id: TxnId, key: &str, val: i32) -> LogRec {
        self.append(
            txn_id,
            LogRecBody::Delete {
                key: key.to_string(),
                val,
            },
        )
    }

    pub fn update_log(
        &mut self,
        txn_id: TxnId,
        old_key: &str,
        old_val: i32,
        new_key: &str,
        new_val: i32,
    ) -> LogRec {
        self.append(
            txn_id,
            LogRecBody::Update {
                old_key: old_key.to_string(),
                old_val,
                new_key: new_key.to_string(),
                new_val,
            },
        )
    }
}

/// A consistent snapshot the engine can restart from.
#[derive(Debug, Clone, Default)]
pub struct CheckPoint {
    pub checkpoint_lsn: Lsn,
    pub active_txns: ActiveTxnTable,
    pub persist_data: KvDatabase,
}

impl CheckPoint {
    pub fn new(checkpoint_lsn: Lsn) -> Self {
        Self {
            checkpoint_lsn,
            active_txns: ActiveTxnTable::new(),
            persist_data: KvDatabase::new(),
        }
    }

    pub fn add_active_txn(&mut self, txn_id: TxnId, last_lsn: Lsn) {
        self.active_txns.insert(txn_id, last_lsn);
    }

    pub fn add_data(&mut self, key: &str, val: i32) {
        self.persist_data.insert(key.to_string(), val);
    }
}

/// Replays the log onto the checkpoint image: redo forward from the
/// checkpoint LSN, then roll back every loser left in the ATT.
#[derive(Debug, Default)]
pub struct RecoveryManager {
    log_recs: BTreeMap<Lsn, LogRec>,
    persist_lsn: Lsn,
    active_txns: ActiveTxnTable,
    data: KvDatabase,
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self {
            log_recs: BTreeMap::new(),
            persist_lsn: INVALID_LSN,
            active_txns: ActiveTxnTable::new(),
            data: KvDatabase::new(),
        }
    }

    pub fn init(&mut self, checkpoint: CheckPoint) {
        self.persist_lsn = checkpoint.checkpoint_lsn;
        self.active_txns = checkpoint.active_txns;
        self.data = checkpoint.persist_data;
    }

    pub fn append_log_rec(&mut self, rec: LogRec) {
        self.log_recs.insert(rec.lsn, rec);
    }

    /// Replays every record at or past the checkpoint LSN in ascending
    /// order, maintaining the ATT as it goes. An `Abort` record replays
    /// the transaction's rollback immediately.
    pub fn redo_phase(&mut self) {
        let recs: Vec<LogRec> = self
            .log_recs
            .range(self.persist_lsn..)
            .map(|(_, rec)| rec.clone())
            .collect();
        for rec in recs {
            self.active_txns.insert(rec.txn_id, rec.lsn);
            match rec.body {
                LogRecBody::Begin => {}
                LogRecBody::Insert { key, val } => {
                    self.data.insert(key, val);
                }
                LogRecBody::Delete { key, .. } => {
                    self.data.remove(&key);
                }
                LogRecBody::Update {
                    old_key,
                    new_key,
                    new_val,
                    ..
                } => {
                    self.data.remove(&old_key);
                    self.data.insert(new_key, new_val);
                }
                LogRecBody::Commit => {
                    self.active_txns.remove(&rec.txn_id);
                }
                LogRecBody::Abort => {
                    self.rollback(rec.txn_id);
                    self.active_txns.remove(&rec.txn_id);
                }
            }
        }
    }

    /// Walks one transaction's chain backwards, inverting each
    /// operation, stopping at the chain end or a missing record.
    pub fn rollback(&mut self, txn_id: TxnId) {
        let mut lsn = self.active_txns.get(&txn_id).copied().unwrap_or(INVALID_LSN);
        while lsn != INVALID_LSN {
            let Some(rec) = self.log_recs.get(&lsn) else {
                break;
            };
            match rec.body.clone() {
                LogRecBody::Insert { key, .. } => {
                    self.data.remove(&key);
                }
                LogRecBody::Delete { key, val } => {
                    self.data.insert(key, val);
                }
                LogRecBody::Update {
                    old_key,
                    old_val,
                    new_key,
                    ..
                } => {
                    self.data.remove(&new_key);
                    self.data.insert(old_key, old_val);
                }
                _ => {}
            }
            lsn = rec.prev_lsn;
        }
    }

    /// Rolls back every loser still in the ATT and clears it.
    pub fn undo_phase(&mut self) {
        let losers: Vec<TxnId> = self.active_txns.keys().copied().collect();
        for txn_id in losers {
            crate::granite_debug_log!("[RecoveryManager::undo_phase] rolling back txn {txn_id}");
            self.rollback(txn_id);
        }
        self.active_txns.clear();
    }

    pub fn db(&self) -> &KvDatabase {
        &self.data
    }

    pub fn active_txns(&self) -> &ActiveTxnTable {
        &self.active_txns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_state_chains_per_transaction() {
        let mut log = LogState::new();
        let a1 = log.begin_log(1);
        let b1 = log.begin_log(2);
        let a2 = log.insert_log(1, "x", 10);
        let b2 = log.insert_log(2, "y", 20);

        assert_eq!(a1.lsn, 1);
        assert_eq!(a1.prev_lsn, INVALID_LSN);
        assert_eq!(b1.lsn, 2);
        assert_eq!(b1.prev_lsn, INVALID_LSN);
        assert_eq!(a2.prev_lsn, a1.lsn);
        assert_eq!(b2.prev_lsn, b1.lsn);
    }

    #[test]
    fn committed_work_survives_redo() {
        let mut log = LogState::new();
        let mut rm = RecoveryManager::new();
        rm.init(CheckPoint::new(0));

        let txn = 1;
        for rec in [
            log.begin_log(txn),
            log.insert_log(txn, "a", 1),
            log.update_log(txn, "a", 1, "a", 2),
            log.commit_log(txn),
        ] {
            rm.append_log_rec(rec);
        }
        rm.redo_phase();
        rm.undo_phase();
        assert_eq!(rm.db().get("a"), Some(&2));
        assert!(rm.active_txns().is_empty());
    }

    #[test]
    fn aborted_transaction_is_rolled_back_during_redo() {
        let mut log = LogState::new();
        let mut rm = RecoveryManager::new();
        // "kept" was present at the checkpoint.
        let mut checkpoint = CheckPoint::new(0);
        checkpoint.add_data("kept", 5);
        rm.init(checkpoint);

        let txn = 3;
        for rec in [
            log.begin_log(txn),
            log.insert_log(txn, "gone", 9),
            log.delete_log(txn, "kept", 5),
            log.abort_log(txn),
        ] {
            rm.append_log_rec(rec);
        }
        rm.redo_phase();
        assert_eq!(rm.db().get("kept"), Some(&5));
        assert!(rm.db().get("gone").is_none());
        assert!(rm.active_txns().is_empty());
    }

    #[test]
    fn losers_are_undone() {
        let mut log = LogState::new();
        let mut rm = RecoveryManager::new();
        let mut checkpoint = CheckPoint::new(0);
        checkpoint.add_data("base", 1);
        rm.init(checkpoint);

        let loser = 7;
        for rec in [
            log.begin_log(loser),
            log.update_log(loser, "base", 1, "base", 99),
            log.insert_log(loser, "temp", 8),
        ] {
            rm.append_log_rec(rec);
        }
        rm.redo_phase();
        assert_eq!(rm.db().get("base"), Some(&99));
        rm.undo_phase();
        assert_eq!(rm.db().get("base"), Some(&1));
        assert!(rm.db().get("temp").is_none());
        assert!(rm.active_txns().is_empty());
    }

    #[test]
    fn records_before_the_checkpoint_are_skipped() {
        let mut log = LogState::new();
        let stale = log.insert_log(1, "stale", 1); // lsn 1
        let fresh = log.insert_log(2, "fresh", 2); // lsn 2

        let mut rm = RecoveryManager::new();
        rm.init(CheckPoint::new(2));
        rm.append_log_rec(stale);
        rm.append_log_rec(fresh);
        rm.redo_phase();
        assert!(rm.db().get("stale").is_none());
        assert_eq!(rm.db().get("fresh"), Some(&2));
        // txn 2 is a loser; its insert is undone.
        rm.undo_phase();
        assert!(rm.db().get("fresh").is_none());
    }
}
