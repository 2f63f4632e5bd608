//! Queuing backends.
//!
//! Two implementations share the lifecycle vocabulary of the manager: the
//! in-memory backend keeps scheduled/running/completed maps in process
//! memory; the stream backend appends serialized works to a partitioned log
//! and approximates those states from log lag.

pub mod memory;
pub mod stream;

pub use memory::MemoryWorkQueuing;
pub use stream::StreamWorkQueuing;
