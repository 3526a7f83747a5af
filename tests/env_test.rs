use std::fs;
use std::sync::mpsc;
use std::time::Duration;

use cowdb::{Config, Environment, TransactionKind};
use tempfile::tempdir;

fn put_one(env: &Environment, tree_name: &str, key: &[u8], value: &[u8]) {
    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, tree_name).unwrap();
    tree.put(&mut txn, key, value).unwrap();
    txn.commit().unwrap();
}

fn read_one(env: &Environment, tree_name: &str, key: &[u8]) -> Option<Vec<u8>> {
    let mut txn = env.new_transaction(TransactionKind::Read).unwrap();
    let tree = env.get_tree(&mut txn, tree_name).unwrap()?;
    tree.get(&mut txn, key).unwrap()
}

#[test]
fn readers_are_anchored_at_their_begin_point() {
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), Config::default()).unwrap();
    put_one(&env, "kv", b"k", b"old");

    // Opened before the second commit: must keep seeing the old value.
    let mut early_reader = env.new_transaction(TransactionKind::Read).unwrap();

    put_one(&env, "kv", b"k", b"new");

    let tree = env.get_tree(&mut early_reader, "kv").unwrap().unwrap();
    assert_eq!(tree.get(&mut early_reader, b"k").unwrap(), Some(b"old".to_vec()));

    // Opened after: sees the committed write.
    let mut late_reader = env.new_transaction(TransactionKind::Read).unwrap();
    let tree = env.get_tree(&mut late_reader, "kv").unwrap().unwrap();
    assert_eq!(tree.get(&mut late_reader, b"k").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn uncommitted_changes_are_invisible_and_rolled_back() {
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), Config::default()).unwrap();
    put_one(&env, "kv", b"kept", b"yes");

    {
        let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
        let tree = env.get_tree(&mut txn, "kv").unwrap().unwrap();
        tree.put(&mut txn, b"ghost", b"never").unwrap();
        tree.delete(&mut txn, b"kept").unwrap();
        // dropped without commit
    }

    assert_eq!(read_one(&env, "kv", b"ghost"), None);
    assert_eq!(read_one(&env, "kv", b"kept"), Some(b"yes".to_vec()));
}

#[test]
fn the_writer_semaphore_admits_one_writer_at_a_time() {
    let dir = tempdir().unwrap();
    let env = std::sync::Arc::new(Environment::open(dir.path(), Config::default()).unwrap());
    let first = env.new_transaction(TransactionKind::ReadWrite).unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let env2 = env.clone();
    let handle = std::thread::spawn(move || {
        let txn = env2.new_transaction(TransactionKind::ReadWrite).unwrap();
        started_tx.send(()).unwrap();
        txn.rollback();
    });

    // The second writer must block while the first is open.
    assert!(started_rx.recv_timeout(Duration::from_millis(150)).is_err());

    // Readers are not gated by the writer semaphore.
    let reader = env.new_transaction(TransactionKind::Read).unwrap();
    drop(reader);

    first.rollback();
    started_rx.recv_timeout(Duration::from_secs(5)).expect("second writer unblocked");
    handle.join().unwrap();
}

#[test]
fn snapshot_facade_reads_committed_state() {
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), Config::default()).unwrap();
    put_one(&env, "kv", b"a", b"1");
    put_one(&env, "kv", b"b", b"2");

    let mut snapshot = env.create_snapshot().unwrap();
    assert_eq!(snapshot.get("kv", b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(snapshot.get("missing", b"a").unwrap(), None);
    let keys: Vec<Vec<u8>> = snapshot
        .iter("kv")
        .unwrap()
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn trees_can_be_created_fetched_and_deleted() {
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), Config::default()).unwrap();

    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, "users").unwrap();
    tree.put(&mut txn, b"u1", b"ada").unwrap();
    txn.commit().unwrap();

    let mut txn = env.new_transaction(TransactionKind::Read).unwrap();
    assert!(env.get_tree(&mut txn, "users").unwrap().is_some());
    assert!(env.get_tree(&mut txn, "absent").unwrap().is_none());
    drop(txn);

    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    assert!(env.delete_tree(&mut txn, "users").unwrap());
    assert!(!env.delete_tree(&mut txn, "users").unwrap());
    assert!(env.get_tree(&mut txn, "users").unwrap().is_none());
    txn.commit().unwrap();

    assert_eq!(read_one(&env, "users", b"u1"), None);
}

#[test]
fn backup_produces_an_openable_copy() {
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), Config::default()).unwrap();
    put_one(&env, "kv", b"original", b"data");
    put_one(&env, "kv", b"more", b"bits");

    let mut image: Vec<u8> = Vec::new();
    let written = env.backup(&mut image).unwrap();
    assert_eq!(written as usize, image.len());
    drop(env);

    let restore_dir = tempdir().unwrap();
    fs::write(restore_dir.path().join("data.db"), &image).unwrap();
    let restored = Environment::open(restore_dir.path(), Config::default()).unwrap();
    assert_eq!(read_one(&restored, "kv", b"original"), Some(b"data".to_vec()));
    assert_eq!(read_one(&restored, "kv", b"more"), Some(b"bits".to_vec()));
}

#[test]
fn stats_reflect_environment_activity() {
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), Config::default()).unwrap();
    put_one(&env, "kv", b"k", b"v");

    let stats = env.stats();
    assert!(stats.last_transaction_id >= 2); // boot + the put
    assert!(stats.next_page_number > 2);
    assert!(stats.journal_files >= 1);
    assert_eq!(stats.active_transactions, 0);

    let txn = env.new_transaction(TransactionKind::Read).unwrap();
    assert_eq!(env.stats().active_transactions, 1);
    drop(txn);
    assert_eq!(env.stats().active_transactions, 0);
}

#[test]
fn freed_pages_return_to_the_free_list_after_flush() {
    let dir = tempdir().unwrap();
    let env = Environment::open(
        dir.path(),
        Config { background_flush: false, ..Config::default() },
    )
    .unwrap();
    put_one(&env, "kv", b"a", &[1u8; 500]);
    put_one(&env, "kv", b"a", &[2u8; 500]); // CoW releases the old pages
    put_one(&env, "kv", b"a", &[3u8; 500]);

    assert_eq!(env.stats().free_pages, 0);
    env.flush_journal().unwrap();
    // With no active readers the superseded page copies are reclaimable.
    assert!(env.stats().free_pages > 0);

    // And a later write reuses them instead of growing the file.
    let grown_before = env.stats().next_page_number;
    put_one(&env, "kv", b"a", &[4u8; 500]);
    assert_eq!(env.stats().next_page_number, grown_before);
}

#[test]
fn repeated_flush_cycles_alternate_header_slots_safely() {
    let dir = tempdir().unwrap();
    let config = Config { background_flush: false, ..Config::default() };
    {
        let env = Environment::open(dir.path(), config.clone()).unwrap();
        for i in 0..5u32 {
            put_one(&env, "kv", format!("k{i}").as_bytes(), b"v");
            env.flush_journal().unwrap();
        }
    }
    // Both header copies were written during the five flushes; the reopen
    // must pick the one with the greatest transaction id.
    let env = Environment::open(dir.path(), config).unwrap();
    for i in 0..5u32 {
        assert_eq!(read_one(&env, "kv", format!("k{i}").as_bytes()), Some(b"v".to_vec()));
    }
}
