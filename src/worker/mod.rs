//! Worker side of the network.
//!
//! - **Execution**: [`Sandbox`] runs source text; [`ProcessSandbox`] does it
//!   with a local interpreter process
//! - **Participation**: [`Worker`] registers presence, reacts to the pending
//!   set, claims work and reports results
//!
//! # Execution Flow
//!
//! 1. A change to `tasks/` wakes the worker's pending watch
//! 2. [`ClaimProtocol::claim_any`](crate::tasks::ClaimProtocol::claim_any)
//!    races other workers for one runnable task
//! 3. The winner marks itself busy, moves the task to `running` and executes it
//! 4. The sandbox result becomes `completed` (stdout) or `failed` (error text)
//! 5. The worker marks itself idle and looks at the pending set again

pub mod executor;
pub mod runner;

pub use executor::{ExecutionError, ProcessSandbox, Sandbox};
pub use runner::Worker;
