mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{key, options};
use quill_store::database::Database;
use quill_store::error::QuillStoreError;
use quill_store::index::{BPlusTreeIndex, LogMode};
use quill_store::transaction::{TransactionId, TxnContext};
use tempfile::TempDir;

fn setup(dir: &TempDir) -> (Arc<Database>, BPlusTreeIndex) {
    let db = Arc::new(Database::open(options(dir.path())).unwrap());
    let ctx = db.begin().unwrap();
    let lease = db.create_index(&ctx, "kv", &db.index_options(true)).unwrap();
    let index = lease.index().clone();
    drop(lease);
    db.commit(&ctx).unwrap();
    (db, index)
}

/// Takes `mine`, then `extra` more keys, then waits for `theirs`. Returns the
/// transaction id when it was chosen as the deadlock victim.
fn contender(
    db: Arc<Database>,
    index: BPlusTreeIndex,
    ctx: TxnContext,
    barrier: Arc<Barrier>,
    mine: Vec<u8>,
    theirs: Vec<u8>,
    extra: std::ops::Range<u32>,
) -> Option<TransactionId> {
    index.insert(&ctx, &mine, b"held", LogMode::Logged).unwrap();
    for i in extra {
        index.insert(&ctx, &key(i), b"extra", LogMode::Logged).unwrap();
    }
    barrier.wait();
    match index.insert(&ctx, &theirs, b"won", LogMode::Logged) {
        Ok(()) => {
            db.commit(&ctx).unwrap();
            None
        }
        Err(err) => {
            assert!(matches!(err, QuillStoreError::Deadlock(_)), "{}", err);
            assert!(err.aborts_transaction());
            db.rollback(&ctx).unwrap();
            Some(ctx.txn_id())
        }
    }
}

struct Outcome {
    db: Arc<Database>,
    index: BPlusTreeIndex,
    older: TransactionId,
    younger: TransactionId,
    victim: TransactionId,
    _dir: TempDir,
}

/// Runs a two-party cycle between an older and a younger transaction.
fn cycle(older_extra: std::ops::Range<u32>, younger_extra: std::ops::Range<u32>) -> Outcome {
    let dir = TempDir::new().unwrap();
    let (db, index) = setup(&dir);
    let older = db.begin().unwrap();
    let younger = db.begin().unwrap();
    let (older_id, younger_id) = (older.txn_id(), younger.txn_id());
    let barrier = Arc::new(Barrier::new(2));

    let spawn = |ctx: TxnContext, mine: &[u8], theirs: &[u8], extra: std::ops::Range<u32>| {
        let (db, index, barrier) = (db.clone(), index.clone(), barrier.clone());
        let (mine, theirs) = (mine.to_vec(), theirs.to_vec());
        thread::spawn(move || contender(db, index, ctx, barrier, mine, theirs, extra))
    };
    let first = spawn(older, b"t1", b"t2", older_extra);
    let second = spawn(younger, b"t2", b"t1", younger_extra);
    let victims: Vec<_> = [first.join().unwrap(), second.join().unwrap()]
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(victims.len(), 1, "exactly one transaction is aborted");
    Outcome {
        db,
        index,
        older: older_id,
        younger: younger_id,
        victim: victims[0],
        _dir: dir,
    }
}

#[test]
fn youngest_breaks_a_tie() {
    let outcome = cycle(0..0, 0..0);
    let (db, index) = (&outcome.db, &outcome.index);
    assert_eq!(outcome.victim, outcome.younger);

    let ctx = db.begin().unwrap();
    assert_eq!(index.get(&ctx, b"t1").unwrap(), Some(b"held".to_vec()));
    assert_eq!(index.get(&ctx, b"t2").unwrap(), Some(b"won".to_vec()));
    db.commit(&ctx).unwrap();
    assert!(db.transaction_manager().active_transactions().is_empty());
}

#[test]
fn fewest_locks_are_sacrificed_first() {
    let outcome = cycle(0..0, 100..104);
    let (db, index) = (&outcome.db, &outcome.index);
    assert_eq!(outcome.victim, outcome.older);

    let ctx = db.begin().unwrap();
    assert_eq!(index.get(&ctx, b"t1").unwrap(), Some(b"won".to_vec()));
    assert_eq!(index.get(&ctx, b"t2").unwrap(), Some(b"held".to_vec()));
    assert_eq!(index.get(&ctx, &key(100)).unwrap(), Some(b"extra".to_vec()));
    assert_eq!(index.verify().unwrap().entries, 6);
    db.commit(&ctx).unwrap();
}
