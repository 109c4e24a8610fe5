//! Background workers.

pub mod command_worker;

pub use command_worker::{
    CommandHandler, CommandOutcome, CommandWorker, CommandWorkerConfig, CommandWorkerHandle,
    WorkOutcome, WorkerStats,
};
