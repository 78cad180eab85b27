//! Incoming batch replay for row-sync.
//!
//! The [`DataWriter`] consumes an ordered stream of table headers and change
//! events for one incoming batch and applies each to the target through the
//! [`Dialect`] seam, consulting the [`ConflictResolver`] when the target's
//! row state disagrees with the source's assumption (fallback semantics).
//!
//! Protocol over one stream:
//! `open → start_batch → (write_table → write_data*)* → finish_batch → close`,
//! with `abort_batch` available mid-stream.

pub mod context;
pub mod dialect;
pub mod filter;
pub mod memory;
pub mod resolver;
pub mod stats;
pub mod template;
pub mod writer;

pub use context::{BinaryEncoding, LoadContext};
pub use dialect::{ConflictKind, Dialect, DialectFlavor, DmlOp, DmlOutcome, DmlStatement};
pub use filter::LoadFilter;
pub use memory::MemoryDialect;
pub use resolver::{
    ApplyFailure, ConflictAction, ConflictPolicy, ConflictResolver, MissingTableAction, Resolution,
};
pub use stats::LoadStatistics;
pub use template::TableTemplate;
pub use writer::{BatchOutcome, DataWriter, FailedPosition};
