//! Shoal - group-aware distributed task queue over a shared Redis keyspace.
//!
//! Producers submit named tasks keyed by an id, a priority and an optional
//! *group*; pools of workers — possibly spread across processes and hosts —
//! draw those tasks from the shared store, respecting per-group arrival
//! order and a configurable cross-group fairness policy.
//!
//! # Core Concepts
//!
//! - **Task**: a unit of work with an id, opaque payload and handler name.
//!   Tasks move through a small state machine (`waiting → active →
//!   completed/failed`, with `delayed` and `paused` detours) whose
//!   lowercase names are part of the wire contract.
//!
//! - **Group**: the scheduler's unit of dispatch. Each group keeps an
//!   arrival-ordered index and a set of executing tasks in the store; the
//!   [`GroupManager`] exposes the atomic claim/complete/requeue primitives
//!   over them. Ungrouped tasks run under a synthetic per-queue group, so
//!   there is one code path.
//!
//! - **Scheduler**: [`GroupScheduler`] decides which group releases the
//!   next task under one of three policies: `round_robin`, `fifo` (global
//!   arrival order) or `priority` (deterministic weighted round-robin).
//!
//! - **Engine**: [`Engine`] ties store, registry, groups, scheduler,
//!   handlers and events together and runs the per-queue worker pools.
//!   Built via [`EngineBuilder`]; an explicit value, never a global.
//!
//! - **Events**: every lifecycle transition is published on the store's
//!   pub/sub channels (`events:{kind}`) and to an in-process broadcast for
//!   local observers. Delivery is best-effort; the registry is the source
//!   of truth.
//!
//! # Quick Start
//!
//! ```ignore
//! use shoal::{EngineBuilder, EngineConfig, HandlerRegistry, SubmitRequest, TaskOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handlers = Arc::new(HandlerRegistry::new());
//!     // handlers.register("resize_image", Arc::new(ResizeImage)).await;
//!
//!     let engine = EngineBuilder::new(EngineConfig::default())
//!         .with_handlers(handlers)
//!         .connect()
//!         .await?;
//!     engine.clone().start().await?;
//!
//!     let id = engine
//!         .enqueue(
//!             SubmitRequest::new("resize_image", b"photo-17".to_vec())
//!                 .with_options(TaskOptions::default().with_group("thumbnails")),
//!         )
//!         .await?;
//!     println!("submitted {id}");
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Examples
//!
//! See the `examples/` directory for complete, runnable examples:
//!
//! - `simple_queue.rs` - enqueue/claim/complete against the group
//!   primitives directly
//! - `runtime_basic.rs` - a full engine with registered handlers
//!
//! # Concurrency Contract
//!
//! The claim primitive moves a task from a group's order index to its
//! processing set inside one optimistic store transaction, re-checking the
//! head identity and the group concurrency cap under the watch. Each task
//! id is therefore held by at most one worker slot at any instant, across
//! every process sharing the store. Completion is at-least-once: a worker
//! that dies mid-task leaves the id in `processing`, from where startup
//! recovery returns it to the order index.

/// Engine, queue and store configuration.
///
/// The `config` module defines [`EngineConfig`], [`QueueConfig`] and
/// [`StoreConfig`], with validation that refuses to start on unusable
/// settings.
pub mod config;

/// Error taxonomy for the queue core.
pub mod error;

/// Lifecycle event kinds, payloads, and the fan-out bus.
///
/// The `events` module provides [`EventKind`], [`TaskEvent`] and
/// [`EventBus`], layering an in-process broadcast over the store's
/// publish/subscribe channels.
pub mod events;

/// Per-group indices and their atomic primitives.
///
/// The `group` module provides [`GroupManager`] — membership, arrival
/// order, processing set, per-task state and cached stats for one group —
/// including the claim primitive that hands each task to exactly one
/// caller under contention.
pub mod group;

/// Handler trait, registry and per-task execution context.
///
/// The `handler` module provides [`TaskHandler`], [`HandlerRegistry`],
/// [`TaskContext`], [`ExecutionStatus`] and [`CancelToken`].
pub mod handler;

/// Task record persistence.
///
/// The `registry` module provides [`TaskRegistry`], storing full task
/// records under `task:{id}` without interpreting their state.
pub mod registry;

/// Retry and claim backoff arithmetic.
pub mod retry;

/// Dispatch policies and the group selector.
///
/// The `scheduler` module provides [`DispatchPolicy`], [`GroupView`] and
/// [`GroupScheduler`].
pub mod scheduler;

/// Store adapter trait and the Redis backend.
pub mod store;

/// The task model: states, priorities, options and records.
pub mod task;

/// Tracing span helpers for the task lifecycle.
pub mod telemetry;

/// The engine and its builder.
pub mod runtime;

pub use config::*;
pub use error::*;
pub use events::*;
pub use group::*;
pub use handler::*;
pub use registry::*;
pub use runtime::*;
pub use scheduler::*;
pub use store::{PubSubMessage, RedisStore, Store, StoreError, StoreOp, TxCondition, TxOutcome};
pub use task::*;
