//! Worker supervision: the [`Worker`] trait and context, the per-worker
//! respawn actor, the [`Supervisor`] runtime, and signal handling.

mod actor;
mod core;
mod shutdown;
mod worker;

pub(crate) use self::core::spawn_account_responder;

pub use self::core::{Supervisor, WorkerSpec};
pub use shutdown::wait_for_shutdown_signal;
pub use worker::{Worker, WorkerContext, WorkerFn, WorkerRef};
