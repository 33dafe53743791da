//! Registry-backed service router
//!
//! This library provides:
//! - [`Router`]: route lookups backed by a routing table kept in sync with a registry
//! - The [`Table`] interface and an in-memory [`MemoryTable`]
//! - Lookup filters and router options

pub mod options;
pub mod router;
pub mod table;

pub use options::{filter, LookupOptions, ReadOptions, RouterOptions};
pub use router::Router;
pub use table::{MemoryTable, MemoryTableWatcher, Table, TableWatcher};
