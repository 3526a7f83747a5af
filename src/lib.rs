//! cowdb — an embedded, single-file key-value storage engine.
//!
//! The engine is organized as a copy-on-write B+ tree whose durability comes
//! from a write-ahead journal: commits append page images plus a checksummed
//! transaction header to journal files, and a background applier migrates
//! them into the data file behind the oldest active reader. Readers get
//! snapshot isolation anchored at transaction begin; a single writer runs at
//! a time.
//!
//! ```rust,ignore
//! let env = Environment::open("./db", Config::default())?;
//! let mut txn = env.new_transaction(TransactionKind::ReadWrite)?;
//! let tree = env.create_tree(&mut txn, "people")?;
//! tree.put(&mut txn, b"ada", b"lovelace")?;
//! txn.commit()?;
//! ```

pub mod common;
pub mod env;
pub mod error;
pub mod journal;
pub mod storage;
pub mod tree;
pub mod txn;

pub use env::{Config, Environment, EnvironmentStats, Snapshot};
pub use error::{DbError, Result};
pub use tree::{PutOutcome, PutResult, Tree, TreeIter, TreeStats};
pub use txn::{Transaction, TransactionKind};
