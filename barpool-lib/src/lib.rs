#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Core library for barpool
//!
//! This library runs a batch of independent tasks across a fixed pool of workers while the
//! controlling process renders every worker's progress bars and relays every worker's log
//! records, as if all the work ran in a single process.
//!
//! # Module Organization
//!
//! - [`channel`]: Non-blocking multi-producer, single-consumer channels
//! - [`protocol`]: Messages exchanged between workers and the coordinator
//! - [`proxy`]: Worker-side stand-ins for progress bars
//! - [`task`]: Task functions, the task registry and task outcomes
//! - [`worker`]: Entry point executed inside each worker process
//! - [`bars`]: Coordinator-side progress bars and the progress registry
//! - [`dispatch`]: Job queue, task handles and worker links
//! - [`coordinator`]: The control loop that multiplexes channels and tracks completion
//! - [`shutdown`]: Cooperative cancellation and interrupt handling
//! - [`config`]: Pool configuration
//! - [`pool`]: The `Pool` facade tying it all together
//! - [`commands`]: Command-line interface

pub type Result<T, E = ohno::AppError> = core::result::Result<T, E>;

pub mod bars;
pub mod channel;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod dispatch;
mod host;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod shutdown;
pub mod task;
pub mod worker;

pub use crate::commands::run;
pub use crate::config::{PoolConfig, WorkerMode};
pub use crate::host::Host;
pub use crate::pool::Pool;
pub use crate::task::{Task, TaskOutcome, TaskRegistry};
