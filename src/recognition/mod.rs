//! Streaming speech recognition: session transport, lifecycle
//! supervision, sentence assembly, and the result queue feeding the
//! relay loop.

pub mod queue;
pub mod sentence;
pub mod session;
pub mod supervisor;

pub use queue::ResultQueue;
pub use sentence::Sentence;
pub use supervisor::{Supervisor, SupervisorHandle};
