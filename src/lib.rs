//! fabr — parallel SSH task execution across a fleet of hosts.
//!
//! A user-authored binary registers named [`Task`]s and hands them to the
//! CLI driver; the engine resolves the host list (hosts, roles, excludes),
//! runs each task once per host either serially or in a bounded parallel
//! pool, multiplexes per-host output onto one terminal, and aggregates
//! per-host results.
//!
//! ```no_run
//! use fabr::{Task, TaskRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut tasks = TaskRegistry::new();
//!     tasks.register(
//!         Task::new("host_type", |ctx| {
//!             Box::pin(async move {
//!                 ctx.run("uname -s", Default::default()).await?;
//!                 Ok(())
//!             })
//!         })
//!         .with_doc("Print each host's kernel name"),
//!     );
//!     std::process::exit(fabr::cli::run(tasks).await);
//! }
//! ```

pub mod cli;
pub mod config;
pub mod env;
pub mod errors;
pub mod executor;
pub mod host;
pub mod hostlist;
pub mod ops;
pub mod output;
pub mod ssh;
pub mod task;
pub mod utils;

pub use env::{Env, Value};
pub use errors::Error;
pub use executor::{ExecutionResult, Executor, TaskResults, TransferOutcome};
pub use hostlist::HostSelection;
pub use ops::{GetOptions, PutOptions, RunOptions, SudoOptions, TaskContext};
pub use task::{Task, TaskRegistry};
