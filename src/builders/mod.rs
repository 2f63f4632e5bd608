//! Builders for assembling a work manager from its parts.

pub mod manager;

pub use manager::WorkManagerBuilder;
