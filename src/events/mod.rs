//! Event bus, typed payloads, and correlation waits.
//!
//! - [`Bus`] — broadcast channel shared by the supervisor and all workers.
//! - [`Event`] / [`Payload`] — typed messages with monotonic sequencing.
//! - [`Bus::await_once`] / [`Bus::request`] — bounded correlation waits
//!   (defined in [`correlate`]).

mod bus;
mod correlate;
mod event;

pub use bus::Bus;
pub use event::{Event, Payload};
