//! Transaction log and checkpoint subsystem for the Sombra storage engine.
//!
//! The [`txlog`] module owns the rotating transaction log, [`checkpoint`]
//! records recovery points into a separate checkpoint log and decides when
//! to take them.

pub mod checkpoint;
pub mod config;
pub mod health;
pub mod log;
pub mod primitives;
pub mod txlog;
pub mod types;

pub use checkpoint::{CheckPointer, CheckpointLogFile, CheckpointScheduler, TriggerInfo};
pub use config::Config;
pub use txlog::TransactionLogFile;
pub use types::{LogPosition, Result, SombraError, TransactionId};
