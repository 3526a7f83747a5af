use cowdb::{Config, Environment, PutOutcome, TransactionKind};
use rand::seq::SliceRandom;
use tempfile::{tempdir, TempDir};

fn open_env(dir: &TempDir) -> Environment {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Environment::open(dir.path(), Config::default()).expect("open environment")
}

#[test]
fn put_get_delete_within_one_transaction() {
    let dir = tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, "kv").unwrap();

    assert_eq!(tree.get(&mut txn, b"missing").unwrap(), None);
    let put = tree.put(&mut txn, b"alpha", b"one").unwrap();
    assert_eq!(put.outcome, PutOutcome::Inserted);
    assert_eq!(put.version, 1);

    // read-your-writes
    assert_eq!(tree.get(&mut txn, b"alpha").unwrap(), Some(b"one".to_vec()));

    let put = tree.put(&mut txn, b"alpha", b"two").unwrap();
    assert_eq!(put.outcome, PutOutcome::Replaced);
    assert_eq!(put.version, 2);
    assert_eq!(tree.get(&mut txn, b"alpha").unwrap(), Some(b"two".to_vec()));

    assert!(tree.delete(&mut txn, b"alpha").unwrap());
    assert!(!tree.delete(&mut txn, b"alpha").unwrap());
    assert_eq!(tree.get(&mut txn, b"alpha").unwrap(), None);
    txn.commit().unwrap();
}

#[test]
fn committed_state_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let env = open_env(&dir);
        let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
        let tree = env.create_tree(&mut txn, "kv").unwrap();
        tree.put(&mut txn, b"k", b"v").unwrap();
        txn.commit().unwrap();
    }
    let env = open_env(&dir);
    let mut txn = env.new_transaction(TransactionKind::Read).unwrap();
    let tree = env.get_tree(&mut txn, "kv").unwrap().expect("tree exists");
    assert_eq!(tree.get(&mut txn, b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn iteration_is_lexicographic_regardless_of_insert_order() {
    let dir = tempdir().unwrap();
    let env = open_env(&dir);

    let mut keys: Vec<Vec<u8>> = (0..500u32)
        .map(|i| format!("key-{:05}", i * 7 % 500).into_bytes())
        .collect();
    keys.sort();
    keys.dedup();
    let mut shuffled = keys.clone();
    shuffled.shuffle(&mut rand::rng());

    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, "sorted").unwrap();
    for key in &shuffled {
        tree.put(&mut txn, key, b"x").unwrap();
    }
    txn.commit().unwrap();

    let mut txn = env.new_transaction(TransactionKind::Read).unwrap();
    let tree = env.get_tree(&mut txn, "sorted").unwrap().unwrap();
    let got: Vec<Vec<u8>> = tree
        .iter(&mut txn, None)
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(got, keys);
}

#[test]
fn range_iteration_starts_at_the_given_key() {
    let dir = tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, "range").unwrap();
    for i in 0..100u32 {
        tree.put(&mut txn, format!("k{i:03}").as_bytes(), b"v").unwrap();
    }
    let from = b"k050".to_vec();
    let got: Vec<Vec<u8>> = tree
        .iter(&mut txn, Some(&from))
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(got.len(), 50);
    assert_eq!(got[0], b"k050".to_vec());
    assert_eq!(got[49], b"k099".to_vec());
}

#[test]
fn bulk_sequential_insert_splits_to_depth_three() {
    let dir = tempdir().unwrap();
    let config = Config { journal_file_size: 16 * 1024 * 1024, ..Config::default() };
    let total: u32 = 30_000;
    {
        let env = Environment::open(dir.path(), config.clone()).unwrap();
        let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
        let tree = env.create_tree(&mut txn, "bulk").unwrap();
        let value = [7u8; 32];
        for i in 0..total {
            tree.put(&mut txn, format!("k{i:06}").as_bytes(), &value).unwrap();
        }
        let stats = tree.stats(&mut txn).unwrap();
        assert!(stats.depth >= 3, "expected depth >= 3, got {}", stats.depth);
        assert_eq!(stats.entry_count, total as u64);
        txn.commit().unwrap();
    }

    let env = Environment::open(dir.path(), config).unwrap();
    let mut txn = env.new_transaction(TransactionKind::Read).unwrap();
    let tree = env.get_tree(&mut txn, "bulk").unwrap().unwrap();
    let mut count = 0u32;
    let mut last: Option<Vec<u8>> = None;
    for item in tree.iter(&mut txn, None).unwrap() {
        let (key, value) = item.unwrap();
        if let Some(prev) = &last {
            assert!(prev < &key, "iteration out of order");
        }
        assert_eq!(value.len(), 32);
        last = Some(key);
        count += 1;
    }
    assert_eq!(count, total);
}

#[test]
fn large_values_round_trip_through_overflow_chains() {
    let dir = tempdir().unwrap();
    let env = open_env(&dir);
    let big: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let medium = vec![3u8; 5000];

    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, "blobs").unwrap();
    tree.put(&mut txn, b"big", &big).unwrap();
    tree.put(&mut txn, b"medium", &medium).unwrap();
    assert_eq!(tree.get(&mut txn, b"big").unwrap(), Some(big.clone()));
    txn.commit().unwrap();

    let mut txn = env.new_transaction(TransactionKind::Read).unwrap();
    let tree = env.get_tree(&mut txn, "blobs").unwrap().unwrap();
    assert_eq!(tree.get(&mut txn, b"big").unwrap(), Some(big.clone()));
    assert_eq!(tree.get(&mut txn, b"medium").unwrap(), Some(medium));

    // replacing an overflow value releases the old chain and stays readable
    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.get_tree(&mut txn, "blobs").unwrap().unwrap();
    tree.put(&mut txn, b"big", b"tiny now").unwrap();
    assert_eq!(tree.get(&mut txn, b"big").unwrap(), Some(b"tiny now".to_vec()));
    txn.commit().unwrap();
}

#[test]
fn deleting_everything_leaves_a_usable_tree() {
    let dir = tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, "shrink").unwrap();
    for i in 0..2000u32 {
        tree.put(&mut txn, format!("k{i:05}").as_bytes(), &[9u8; 40]).unwrap();
    }
    txn.commit().unwrap();

    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.get_tree(&mut txn, "shrink").unwrap().unwrap();
    for i in 0..2000u32 {
        assert!(tree.delete(&mut txn, format!("k{i:05}").as_bytes()).unwrap());
    }
    let stats = tree.stats(&mut txn).unwrap();
    assert_eq!(stats.entry_count, 0);
    assert_eq!(tree.iter(&mut txn, None).unwrap().count(), 0);
    // still writable after the root collapsed
    tree.put(&mut txn, b"again", b"yes").unwrap();
    txn.commit().unwrap();

    let mut txn = env.new_transaction(TransactionKind::Read).unwrap();
    let tree = env.get_tree(&mut txn, "shrink").unwrap().unwrap();
    assert_eq!(tree.get(&mut txn, b"again").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn multi_value_sets_collect_duplicate_values_per_key() {
    let dir = tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, "tags").unwrap();
    tree.multi_add(&mut txn, b"post-1", b"rust").unwrap();
    tree.multi_add(&mut txn, b"post-1", b"storage").unwrap();
    tree.multi_add(&mut txn, b"post-1", b"btree").unwrap();
    tree.multi_add(&mut txn, b"post-2", b"journal").unwrap();

    let values: Vec<Vec<u8>> = tree
        .multi_iter(&mut txn, b"post-1")
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(values, vec![b"btree".to_vec(), b"rust".to_vec(), b"storage".to_vec()]);
    txn.commit().unwrap();

    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.get_tree(&mut txn, "tags").unwrap().unwrap();
    let values: Vec<Vec<u8>> = tree
        .multi_iter(&mut txn, b"post-2")
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(values, vec![b"journal".to_vec()]);
    // adding to a committed set keeps earlier members
    tree.multi_add(&mut txn, b"post-2", b"applier").unwrap();
    let values: Vec<Vec<u8>> = tree
        .multi_iter(&mut txn, b"post-2")
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(values, vec![b"applier".to_vec(), b"journal".to_vec()]);
}

#[test]
fn plain_value_is_promoted_into_a_multi_value_set() {
    let dir = tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, "promote").unwrap();
    tree.put(&mut txn, b"k", b"first").unwrap();
    tree.multi_add(&mut txn, b"k", b"second").unwrap();
    txn.commit().unwrap();

    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.get_tree(&mut txn, "promote").unwrap().unwrap();
    let values: Vec<Vec<u8>> = tree
        .multi_iter(&mut txn, b"k")
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(values, vec![b"first".to_vec(), b"second".to_vec()]);
}

#[test]
fn oversized_keys_are_rejected() {
    let dir = tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, "limits").unwrap();
    let huge_key = vec![1u8; 4096];
    assert!(tree.put(&mut txn, &huge_key, b"v").is_err());
}
