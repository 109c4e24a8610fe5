//! `cmdlease-core`: command dispatch building blocks.
//!
//! This crate contains the **pure** model of a leased command: identifiers,
//! the record and its state machine, the error taxonomy and the clock seam.
//! No locks, threads or storage live here.

pub mod clock;
pub mod command;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{
    ClaimedCommand, CommandRecord, CommandState, CommandStatus, CommandView, Lease, StateVersion,
    Transition,
};
pub use error::{CommandError, CommandResult, ConflictReason, NotFound};
pub use id::{CommandId, ConsumerId, InvalidId};
