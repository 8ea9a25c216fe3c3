//! The execution-engine side of a stream.
//!
//! - [`event`]: raw events a session delivers
//! - [`provider`]: the contract for creating, prompting and aborting sessions
//! - [`process`]: a provider that drives engines as child processes over JSON lines
//! - [`spawn`]: child process plumbing used by [`process`]

pub mod event;
pub mod process;
pub mod provider;
pub mod spawn;
