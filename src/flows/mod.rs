//! Workflow state machines over the abstract page oracle.
//!
//! Each workflow is a finite sequence of page-state transitions driven by
//! URL patterns and the error-indicator contract, with every step bounded by
//! a timeout and every failure classified retryable or terminal
//! ([`crate::error::FlowError`]).
//!
//! Driver implementations resolve the semantic control identifiers exported
//! from each flow's `controls` module to concrete markup.

pub mod login;
pub mod mobile;
pub mod page;
pub mod register;

pub use login::run_login;
pub use mobile::run_phone_change;
pub use page::{DriverFactory, PageDriver};
pub use register::{run_registration, RegisterEngine};
