//! # Workyard
//!
//! A bounded-concurrency work scheduling and execution engine.
//!
//! Workyard lets an application submit named units of deferred work, route
//! them by category to independent queues, execute them under transactional
//! and retry discipline, and observe their lifecycle
//! (`Scheduled → Running → {Completed | Failed | Canceled}`).
//!
//! ## Core Problem Solved
//!
//! Background work in a long-lived server has constraints a plain thread pool
//! does not cover:
//!
//! - **Per-category concurrency bounds**: a slow import queue must not starve
//!   interactive housekeeping jobs.
//! - **Graceful suspension**: shutting down must not lose in-flight work;
//!   running units are asked to stop and are re-marked scheduled for replay.
//! - **Transactional scheduling**: work scheduled inside a transaction should
//!   only become visible if that transaction commits.
//! - **Conflict retry**: optimistic-locking collisions are expected and are
//!   retried against a per-unit budget instead of failing the unit.
//!
//! ## Key Features
//!
//! - **Queue routing**: categories map to queues, each with its own capacity,
//!   worker count, and enable/disable toggles.
//! - **Blocking container**: FIFO handoff that pauses without losing items
//!   and grants reentrant submitters headroom so a worker scheduling more
//!   work never deadlocks against its own full queue.
//! - **Two queuing backends**: an in-process in-memory backend, and a
//!   log-stream backend for multi-node deployments that appends serialized
//!   works to a partitioned log.
//! - **Cooperative shutdown**: running units poll a suspend flag; the engine
//!   never kills in-flight logic.
//!
//! ## Example
//!
//! ```rust,ignore
//! use workyard::builders::WorkManagerBuilder;
//! use workyard::config::WorkManagerConfig;
//! use workyard::core::{SchedulePolicy, Work};
//!
//! let manager = WorkManagerBuilder::new()
//!     .config(WorkManagerConfig::from_json_str(cfg_json)?)
//!     .executor(my_executor) // implements WorkExecutor
//!     .build()?;
//! manager.start()?;
//!
//! let work = Work::new("imports", serde_json::json!({"path": "/tmp/batch"}));
//! manager.schedule(work, SchedulePolicy::Enqueue)?;
//! assert!(manager.await_completion(Some("imports"), Duration::from_secs(30))?);
//! ```
//!
//! For complete examples, see the integration tests under `tests/`.

#![deny(unsafe_code)]
#![warn(clippy::all)]

/// Core scheduling abstractions: work units, containers, pools, the manager.
pub mod core;
/// Configuration models for queues and backend selection.
pub mod config;
/// Builders to construct a work manager from configuration.
pub mod builders;
/// Infrastructure adapters: queuing backends, partitioned log, state store.
pub mod infra;
/// Shared utilities.
pub mod util;
