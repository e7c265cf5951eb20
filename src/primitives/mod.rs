//! Low-level primitives shared by the log stores.
//!
//! Includes positioned file I/O, native OS file hints, and the
//! synchronization primitives used by the checkpoint coordinator.

/// Concurrency primitives and synchronization.
///
/// The checkpoint section, force batching, and the commit barrier.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Native OS file-cache hints.
pub mod native;
