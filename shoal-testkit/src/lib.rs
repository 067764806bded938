//! Test support for shoal: an in-memory [`shoal::Store`] implementation
//! with faithful transaction semantics, and scripted task handlers for
//! driving the worker runtime in tests and examples.

mod handlers;
mod store;

pub use handlers::{
    AlwaysFailHandler, ExecutionRecord, FlakyHandler, RecordingHandler, SleepingHandler,
};
pub use store::InMemoryStore;
