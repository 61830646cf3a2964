//! Fan-out/join coordination for parallel workflow steps.
//!
//! A parallel step of width N runs as N task instances. The control instance
//! (offset 0) plans sibling identities, optionally launches them, and joins on
//! their outcomes; worker instances run the step body and report back through
//! the shared [`runtime::storage::StateStore`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod launch;
pub mod rendezvous;
pub mod runtime;

pub use error::{CoordinatorError, Result};
