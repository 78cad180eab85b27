//! Outgoing batch building and routing for row-sync.
//!
//! The batch builder turns the backlog of pending [`sync_model::ChangeEvent`]s
//! into a deterministic, bounded set of [`OutgoingBatch`]es per target node
//! and channel. Persistence sits behind the async [`BatchStore`] trait;
//! [`MemoryBatchStore`] backs tests and the offline CLI while deployments
//! plug in a database-backed store.

pub mod batch;
pub mod builder;
pub mod lock;
pub mod memory;
pub mod store;

pub use batch::{BatchStatus, BatchType, OutgoingBatch};
pub use builder::BatchService;
pub use lock::NodeLocks;
pub use memory::MemoryBatchStore;
pub use store::BatchStore;
