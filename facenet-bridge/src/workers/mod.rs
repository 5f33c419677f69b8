//! Worker process management for the face bridge
//!
//! This module contains the `WorkerSession` that owns a Python worker
//! subprocess and the framed pipe used to talk to it.

mod pipe;
mod session;

pub use pipe::FramedPipe;
pub use session::{SessionState, WorkerSession};
