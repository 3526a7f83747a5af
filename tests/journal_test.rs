use std::fs;
use std::path::Path;

use cowdb::{Config, DbError, Environment, TransactionKind};
use tempfile::tempdir;

/// Simulates `kill -9`: the environment is abandoned without the shutdown
/// flush, leaving only what the journal fsyncs made durable.
fn crash(env: Environment) {
    std::mem::forget(env);
}

fn crash_config() -> Config {
    Config { background_flush: false, ..Config::default() }
}

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

fn copy_dir(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), dst.join(entry.file_name())).unwrap();
    }
}

fn journal_paths(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "journal"))
        .collect();
    paths.sort();
    paths
}

#[test]
fn committed_transactions_survive_a_crash() {
    let dir = tempdir().unwrap();
    {
        let env = Environment::open(dir.path(), crash_config()).unwrap();
        put_one(&env, "kv", b"k1", b"v1");
        put_one(&env, "kv", b"k2", b"v2");
        crash(env);
    }
    let env = Environment::open(dir.path(), crash_config()).unwrap();
    assert_eq!(read_one(&env, "kv", b"k1"), Some(b"v1".to_vec()));
    assert_eq!(read_one(&env, "kv", b"k2"), Some(b"v2".to_vec()));
}

#[test]
fn recovery_is_idempotent_across_reopens() {
    let dir = tempdir().unwrap();
    {
        let env = Environment::open(dir.path(), crash_config()).unwrap();
        put_one(&env, "kv", b"stable", b"value");
        crash(env);
    }
    for _ in 0..3 {
        let env = Environment::open(dir.path(), crash_config()).unwrap();
        assert_eq!(read_one(&env, "kv", b"stable"), Some(b"value".to_vec()));
        crash(env);
    }
}

#[test]
fn corrupted_transaction_rolls_back_to_the_previous_commit() {
    let dir = tempdir().unwrap();
    {
        let env = Environment::open(dir.path(), crash_config()).unwrap();
        put_one(&env, "kv", b"k1", b"v1");
        put_one(&env, "kv", b"k2", b"v2");
        crash(env);
    }

    // Flip a byte inside the data pages of the last journal transaction.
    let paths = journal_paths(dir.path());
    let path = paths.last().unwrap();
    let mut bytes = fs::read(path).unwrap();
    let marker = b"COWTXN\x00\x01";
    let page_size = 4096;
    let last_header_page = (0..bytes.len() / page_size)
        .rev()
        .find(|&p| bytes[p * page_size..].starts_with(marker))
        .expect("journal contains transaction headers");
    let victim = (last_header_page + 1) * page_size + 100;
    bytes[victim] ^= 0xff;
    fs::write(path, &bytes).unwrap();

    let env = Environment::open(dir.path(), crash_config()).unwrap();
    // The checksum mismatch makes the last transaction uncommitted; the one
    // before it is intact.
    assert_eq!(read_one(&env, "kv", b"k1"), Some(b"v1".to_vec()));
    assert_eq!(read_one(&env, "kv", b"k2"), None);
}

#[test]
fn truncated_journal_yields_a_prefix_of_committed_state() {
    let base = tempdir().unwrap();
    {
        let env = Environment::open(base.path(), crash_config()).unwrap();
        put_one(&env, "kv", b"k1", b"v1");
        put_one(&env, "kv", b"k2", b"v2");
        put_one(&env, "kv", b"k3", b"v3");
        crash(env);
    }
    let paths = journal_paths(base.path());
    let journal = paths.last().unwrap().clone();
    let full_len = fs::metadata(&journal).unwrap().len();

    // Cut the journal at a sweep of byte offsets; every cut must reopen to
    // a clean prefix of the committed transactions, never a mixed state.
    let mut cut = 0u64;
    while cut < full_len {
        let scratch = tempdir().unwrap();
        copy_dir(base.path(), scratch.path());
        let target = scratch.path().join(journal.file_name().unwrap());
        let file = fs::OpenOptions::new().write(true).open(&target).unwrap();
        file.set_len(cut).unwrap();
        drop(file);

        let env = Environment::open(scratch.path(), crash_config()).unwrap();
        let k1 = read_one(&env, "kv", b"k1").is_some();
        let k2 = read_one(&env, "kv", b"k2").is_some();
        let k3 = read_one(&env, "kv", b"k3").is_some();
        // prefix property: a later commit is never visible without all
        // earlier ones
        assert!(!k3 || k2, "k3 visible without k2 at cut {cut}");
        assert!(!k2 || k1, "k2 visible without k1 at cut {cut}");
        cut += 65_537; // prime stride: hits headers, page bodies, and mid-page cuts
    }
}

#[test]
fn split_transaction_spans_two_journal_files_and_recovers() {
    let dir = tempdir().unwrap();
    // 8-page journal files force any sizable transaction to split.
    let config = Config {
        journal_file_size: 8 * 4096,
        background_flush: false,
        ..Config::default()
    };
    let values: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i + 1; 3000]).collect();
    {
        let env = Environment::open(dir.path(), config.clone()).unwrap();
        let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
        let tree = env.create_tree(&mut txn, "big").unwrap();
        for (i, value) in values.iter().enumerate() {
            tree.put(&mut txn, format!("key{i}").as_bytes(), value).unwrap();
        }
        txn.commit().unwrap();
        crash(env);
    }
    assert!(
        journal_paths(dir.path()).len() >= 2,
        "transaction should have spilled into a second journal file"
    );

    let env = Environment::open(dir.path(), config).unwrap();
    for (i, value) in values.iter().enumerate() {
        assert_eq!(read_one(&env, "big", format!("key{i}").as_bytes()).as_ref(), Some(value));
    }

    // Journal files stay until the background flush retires them.
    let before = env.stats().journal_files;
    assert!(before >= 2);
    env.flush_journal().unwrap();
    assert!(env.stats().journal_files < before);
    for (i, value) in values.iter().enumerate() {
        assert_eq!(read_one(&env, "big", format!("key{i}").as_bytes()).as_ref(), Some(value));
    }
}

#[test]
fn transaction_spanning_three_files_is_rejected() {
    let dir = tempdir().unwrap();
    let config = Config {
        journal_file_size: 4 * 4096, // minimum capacity: 4 pages per file
        background_flush: false,
        ..Config::default()
    };
    let env = Environment::open(dir.path(), config).unwrap();
    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, "huge").unwrap();
    for i in 0..10u8 {
        tree.put(&mut txn, format!("key{i}").as_bytes(), &vec![i; 3000]).unwrap();
    }
    let err = txn.commit().unwrap_err();
    assert!(matches!(err, DbError::TransactionTooLarge { .. }), "got {err:?}");

    // The failed transaction rolled back; the environment keeps working.
    put_one(&env, "huge", b"small", b"fits");
    assert_eq!(read_one(&env, "huge", b"small"), Some(b"fits".to_vec()));
}

#[test]
fn applied_state_survives_without_any_journal_files() {
    let dir = tempdir().unwrap();
    {
        let env = Environment::open(dir.path(), crash_config()).unwrap();
        put_one(&env, "kv", b"durable", b"bits");
        env.flush_journal().unwrap();
        crash(env);
    }
    // Everything is in the data file now; losing the journals is harmless.
    for path in journal_paths(dir.path()) {
        fs::remove_file(path).unwrap();
    }
    let env = Environment::open(dir.path(), crash_config()).unwrap();
    assert_eq!(read_one(&env, "kv", b"durable"), Some(b"bits".to_vec()));
}
