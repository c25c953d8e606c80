//! Backends of the durable cache tier.
//!
//! [`MemoryStore`] keeps everything in the process and is what tests and throw-away sessions use. [`LmdbStore`]
//! persists entries with LMDB so they outlive the process.

pub mod lmdb;
pub mod memory;

pub use lmdb::LmdbStore;
pub use memory::MemoryStore;
