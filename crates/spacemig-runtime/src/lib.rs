//! Work acquisition and the per-space migration loop.
//!
//! Workers share nothing in memory. Every coordination decision is a conditional
//! write against the [`spacemig_storage::MigrationLedger`]; a worker that loses a
//! race drops the space and goes back to [`WorkCoordinator::acquire_work`].

mod coordinator;
mod worker;

pub use coordinator::{CoordinatorConfig, WorkCoordinator};
pub use worker::{
    MigrationWorker, SpaceOutcome, SpaceReport, WorkerConfig, WorkerError, WorkerTickReport,
};
