//! Core data model for row-sync.
//!
//! This crate defines the types shared by the batching and loading engines:
//!
//! - [`ChangeEvent`]: one trigger-captured row mutation
//! - [`Channel`] / [`NodeChannel`] / [`ChannelCache`]: batching policy lanes
//! - [`TableSchema`]: target table column/key layout
//! - [`SyncError`]: the typed error taxonomy
//!
//! The crate deliberately contains no I/O beyond the [`ChannelSource`]
//! boundary; persistence and database access live behind traits in the
//! service crates.

pub mod channel;
pub mod error;
pub mod event;
pub mod schema;
pub mod values;

pub use channel::{Channel, ChannelCache, ChannelSource, NodeChannel, StaticChannelSource};
pub use error::SyncError;
pub use event::{ChangeEvent, EventKind, TableHeader, TableRef};
pub use schema::{ColumnDef, ColumnKind, TableSchema};
pub use values::{project, RowValue, REQUIRED_EMPTY_SENTINEL};
