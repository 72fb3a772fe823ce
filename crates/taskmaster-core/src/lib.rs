// SPDX-License-Identifier: Apache-2.0

//! Supervision engine for Taskmaster: program specs, per-instance workers,
//! fleets, and the Supervisor control façade. No process talks to the
//! outside world from this crate — REPL/socket/HTTP surfaces live in
//! `taskmaster-cli` and drive this engine through [`supervisor::Supervisor`].

pub mod error;
pub mod fleet;
pub mod signal;
pub mod spec;
pub mod supervisor;
pub mod worker;

pub use error::{CoreError, CoreResult};
pub use fleet::Fleet;
pub use signal::{SignalName, SignalPort};
pub use spec::{ProgramSpec, RestartPolicy};
pub use supervisor::{ProgramStatus, ReloadReport, Supervisor};
pub use worker::{Worker, WorkerSnapshot, WorkerState};

/// Crate version for daemon diagnostics (`version` REPL/socket command).
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
