//! Embedded host database: snapshot-isolated reads, single-writer commits.

mod engine;

pub use engine::{Database, ReadTransaction, WriteTransaction};
