use granite::log_manager::LogManager;
use granite::recovery::{CheckPoint, LogRec, LogRecBody, LogState, RecoveryManager};
use granite::INVALID_LSN;
use tempfile::tempdir;

/// The canonical restart scenario: a checkpoint with one live
/// transaction, a committed updater and an in-flight inserter in the
/// tail of the log.
#[test]
fn redo_then_undo_reconciles_winners_and_losers() {
    let mut rm = RecoveryManager::new();
    let mut checkpoint = CheckPoint::new(5);
    checkpoint.add_active_txn(1, 5);
    checkpoint.add_data("a", 1);
    rm.init(checkpoint);

    for rec in [
        LogRec {
            lsn: 6,
            txn_id: 1,
            prev_lsn: 5,
            body: LogRecBody::Update {
                old_key: "a".to_string(),
                old_val: 1,
                new_key: "a".to_string(),
                new_val: 2,
            },
        },
        LogRec {
            lsn: 7,
            txn_id: 2,
            prev_lsn: INVALID_LSN,
            body: LogRecBody::Begin,
        },
        LogRec {
            lsn: 8,
            txn_id: 2,
            prev_lsn: 7,
            body: LogRecBody::Insert {
                key: "b".to_string(),
                val: 3,
            },
        },
        LogRec {
            lsn: 9,
            txn_id: 1,
            prev_lsn: 6,
            body: LogRecBody::Commit,
        },
    ] {
        rm.append_log_rec(rec);
    }

    rm.redo_phase();
    rm.undo_phase();

    assert_eq!(rm.db().len(), 1);
    assert_eq!(rm.db().get("a"), Some(&2));
    assert!(rm.active_txns().is_empty());
}

/// The image after recovery equals the image of applying only committed
/// transactions to the checkpoint state.
#[test]
fn recovered_image_matches_committed_history() {
    let mut log = LogState::new();
    let mut recs = Vec::new();
    // Committed writer.
    recs.push(log.begin_log(1));
    recs.push(log.insert_log(1, "x", 1));
    recs.push(log.update_log(1, "x", 1, "y", 2));
    recs.push(log.commit_log(1));
    // Aborted writer whose rollback is already in the log.
    recs.push(log.begin_log(2));
    recs.push(log.insert_log(2, "z", 3));
    recs.push(log.abort_log(2));
    // Loser with no terminal record.
    recs.push(log.begin_log(3));
    recs.push(log.delete_log(3, "y", 2));

    let mut rm = RecoveryManager::new();
    rm.init(CheckPoint::new(0));
    for rec in recs {
        rm.append_log_rec(rec);
    }
    rm.redo_phase();
    rm.undo_phase();

    assert_eq!(rm.db().len(), 1);
    assert_eq!(rm.db().get("y"), Some(&2));
    assert!(rm.active_txns().is_empty());
}

/// Records persisted through the log manager drive the same recovery
/// after a restart.
#[test]
fn recovery_replays_a_persisted_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("granite.log");
    {
        let mut state = LogState::new();
        let mut log = LogManager::open(&path).unwrap();
        for rec in [
            state.begin_log(1),
            state.insert_log(1, "durable", 11),
            state.commit_log(1),
            state.begin_log(2),
            state.insert_log(2, "volatile", 22),
        ] {
            log.append(&rec).unwrap();
        }
    }

    let mut log = LogManager::open(&path).unwrap();
    let mut rm = RecoveryManager::new();
    rm.init(CheckPoint::new(0));
    for rec in log.read_all().unwrap() {
        rm.append_log_rec(rec);
    }
    rm.redo_phase();
    rm.undo_phase();

    assert_eq!(rm.db().get("durable"), Some(&11));
    assert!(rm.db().get("volatile").is_none());
    assert!(rm.active_txns().is_empty());
}
