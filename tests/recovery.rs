mod common;

use common::{key, options, value};
use quill_store::database::Database;
use quill_store::error::QuillStoreError;
use quill_store::index::LogMode;
use tempfile::TempDir;

fn load_committed(db: &Database, n: u32) {
    let ctx = db.begin().unwrap();
    let index = db.create_index(&ctx, "kv", &db.index_options(true)).unwrap();
    for i in 0..n {
        index.insert(&ctx, &key(i), &value(i), LogMode::Logged).unwrap();
    }
    drop(index);
    db.commit(&ctx).unwrap();
}

#[test]
fn uncommitted_work_is_gone_after_a_crash() {
    let dir = TempDir::new().unwrap();
    let loser_id = {
        let db = Database::open(options(dir.path())).unwrap();
        load_committed(&db, 100);

        let loser = db.begin().unwrap();
        let index = db.open_index(&loser, "kv").unwrap();
        index.insert(&loser, b"k", b"never committed", LogMode::Logged).unwrap();
        for i in 0..20 {
            index.delete(&loser, &key(i), None, LogMode::Logged).unwrap();
        }
        index.update(&loser, &key(50), b"changed", LogMode::Logged).unwrap();
        // the loser's pages reach the disk before the crash
        db.buffer_manager().sync_all().unwrap();
        let loser_id = loser.txn_id();
        drop(index);
        drop(loser);
        db.simulate_crash().unwrap();
        loser_id
    };

    let db = Database::open(options(dir.path())).unwrap();
    assert_eq!(db.recovery_summary().loser_transactions, vec![loser_id]);
    assert!(db.recovery_summary().next_txn_id > loser_id);

    let ctx = db.begin().unwrap();
    let index = db.open_index(&ctx, "kv").unwrap();
    assert_eq!(index.get(&ctx, b"k").unwrap(), None);
    for i in 0..100 {
        assert_eq!(index.get(&ctx, &key(i)).unwrap(), Some(value(i)));
    }
    assert_eq!(index.verify().unwrap().entries, 100);
    drop(index);
    db.commit(&ctx).unwrap();
}

#[test]
fn committed_work_is_redone_after_a_crash() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(options(dir.path())).unwrap();
        load_committed(&db, 300);
        let ctx = db.begin().unwrap();
        let index = db.open_index(&ctx, "kv").unwrap();
        for i in (0..300).step_by(3) {
            index.delete(&ctx, &key(i), None, LogMode::Logged).unwrap();
        }
        drop(index);
        db.commit(&ctx).unwrap();
        db.simulate_crash().unwrap();
    }

    let db = Database::open(options(dir.path())).unwrap();
    assert!(db.recovery_summary().redo_count > 0);
    assert!(db.recovery_summary().loser_transactions.is_empty());
    let ctx = db.begin().unwrap();
    let index = db.open_index(&ctx, "kv").unwrap();
    let keys: Vec<_> = index
        .scan(&ctx, ..)
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    let expected: Vec<_> = (0..300).filter(|i| i % 3 != 0).map(key).collect();
    assert_eq!(keys, expected);
    index.verify().unwrap();
    drop(index);
    db.commit(&ctx).unwrap();
}

#[test]
fn checkpoint_bounds_the_redo_pass() {
    let dir = TempDir::new().unwrap();
    let checkpoint = {
        let db = Database::open(options(dir.path())).unwrap();
        load_committed(&db, 50);
        let running = db.begin().unwrap();
        let index = db.open_index(&running, "kv").unwrap();
        index.insert(&running, b"before", b"1", LogMode::Logged).unwrap();
        let checkpoint = db.flush().unwrap();
        index.insert(&running, b"after", b"2", LogMode::Logged).unwrap();
        drop(index);
        drop(running);
        db.simulate_crash().unwrap();
        checkpoint
    };

    let db = Database::open(options(dir.path())).unwrap();
    assert_eq!(db.recovery_summary().checkpoint_lsn, Some(checkpoint));
    assert_eq!(db.recovery_summary().loser_transactions.len(), 1);
    let ctx = db.begin().unwrap();
    let index = db.open_index(&ctx, "kv").unwrap();
    assert_eq!(index.get(&ctx, b"before").unwrap(), None);
    assert_eq!(index.get(&ctx, b"after").unwrap(), None);
    assert_eq!(index.verify().unwrap().entries, 50);
    drop(index);
    db.commit(&ctx).unwrap();
}

#[test]
fn crash_right_after_recovery_is_harmless() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(options(dir.path())).unwrap();
        load_committed(&db, 40);
        let loser = db.begin().unwrap();
        let index = db.open_index(&loser, "kv").unwrap();
        for i in 40..120 {
            index.insert(&loser, &key(i), &value(i), LogMode::Logged).unwrap();
        }
        drop(index);
        drop(loser);
        db.simulate_crash().unwrap();
    }
    {
        let db = Database::open(options(dir.path())).unwrap();
        assert_eq!(db.recovery_summary().loser_transactions.len(), 1);
        db.simulate_crash().unwrap();
    }

    let db = Database::open(options(dir.path())).unwrap();
    assert!(db.recovery_summary().loser_transactions.is_empty());
    let ctx = db.begin().unwrap();
    let index = db.open_index(&ctx, "kv").unwrap();
    assert_eq!(index.verify().unwrap().entries, 40);
    drop(index);
    db.commit(&ctx).unwrap();
}

#[test]
fn uncommitted_index_creation_is_forgotten() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(options(dir.path())).unwrap();
        load_committed(&db, 5);
        let ctx = db.begin().unwrap();
        let scratch = db
            .create_index(&ctx, "scratch", &db.index_options(false))
            .unwrap();
        scratch.insert(&ctx, b"a", b"1", LogMode::Logged).unwrap();
        drop(scratch);
        drop(ctx);
        db.simulate_crash().unwrap();
    }

    let db = Database::open(options(dir.path())).unwrap();
    let ctx = db.begin().unwrap();
    assert!(matches!(
        db.open_index(&ctx, "scratch"),
        Err(QuillStoreError::IndexAccess(_))
    ));
    let names: Vec<_> = db
        .list_indexes(&ctx)
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, vec!["kv".to_string()]);
    let again = db
        .create_index(&ctx, "scratch", &db.index_options(false))
        .unwrap();
    assert!(again.is_empty().unwrap());
    drop(again);
    db.commit(&ctx).unwrap();
}
