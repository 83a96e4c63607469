//! Embedded single-writer relational store.
//!
//! SQLite via `rusqlite`'s `bundled` feature, one `Store` per process,
//! `Mutex<Connection>`-serialized writes, WAL for concurrent readers.
//! Generalizes `state_manager.rs`'s pattern to the full data model.

mod schema;
mod store;

pub use store::Store;
