//! Command-line interface for barpool
//!
//! The binary doubles as its own worker: a pool in process mode re-runs the current
//! executable with the hidden `worker` subcommand, and that process serves jobs until its
//! stdin closes.
//!
//! ## Commands
//!
//! - **demo**: Run a batch of tasks that drive three nested progress bars each, with worker
//!   log records relayed to the terminal and a global bar counting finished tasks
//! - **init**: Generate a default configuration file
//! - **worker** (hidden): Serve jobs from a coordinating pool

mod common;
mod demo;
mod init;
mod run;

pub use crate::host::Host;
pub use common::{ColorMode, LogLevel, init_logging};
pub use demo::{DemoArgs, NESTED_TASK, demo_tasks, run_demo};
pub use init::{InitArgs, init_config};
pub use run::run;
