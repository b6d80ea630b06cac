use thiserror::Error;

use crate::config::ConfigError;
use crate::core::{InvalidId, StateMachineError};
use crate::manager::log::LogError;
use crate::manager::snapshot::SnapshotError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the canonical per-module
/// errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Invalid(#[from] InvalidId),
}
