//! keel-wal: file-backed log store for the keel replication core.
//!
//! Implements `keel_raft::LogStore` over per-partition append-only record
//! files with CRC32C-checksummed frames. Proposed and committed records
//! share the file; commit is a superseding append resolved by a
//! latest-record-per-id index rebuilt on open. Writes are synchronous-
//! durable, and a torn or corrupt tail is truncated away during open.

pub mod record;
pub mod store;

pub use record::RecordError;
pub use store::FileLogStore;
