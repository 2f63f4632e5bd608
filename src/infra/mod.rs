//! Infrastructure adapters: queuing backends, partitioned log, state store.

pub mod log;
pub mod queuing;
pub mod state;

pub use log::{LogRecord, PartitionedLog};
pub use queuing::memory::MemoryWorkQueuing;
pub use queuing::stream::StreamWorkQueuing;
pub use state::StateStore;
