//! warden-io: a single-threaded async I/O runtime with interchangeable
//! readiness and completion reactors.
//!
//! # Overview
//!
//! A *warden* owns an event loop and multiplexes socket and timer
//! operations for suspendable tasks. Every operation returns a scoped
//! handle ([`Iop`]): awaiting it suspends the task, dropping it cancels
//! the operation and releases every registration it holds. Two reactors
//! implement the same [`Warden`] contract:
//!
//! - [`PollWarden`]: readiness-based. Eager syscall, park on
//!   would-block, retry when the descriptor is ready.
//! - [`UringWarden`]: completion-based. Submit to io_uring, harvest
//!   kernel completions (Linux, `io-uring` feature).
//!
//! # Core Guarantees
//!
//! - **No dangling registrations**: cancellation (handle drop, task
//!   drop, deadline expiry) unregisters synchronously; late readiness or
//!   kernel completions for dead operations are discarded.
//! - **Deterministic ordering**: within one descriptor and direction,
//!   operations resume in submission order; timers fire in deadline
//!   order with ties broken by insertion order.
//! - **Deterministic resources**: descriptors close on handle drop; each
//!   completion record is freed exactly once.
//! - **Single-threaded cooperative**: tasks suspend only at operation
//!   await points; between awaits they run atomically.
//!
//! # Module Structure
//!
//! - [`warden`]: the [`Warden`] contract and both reactors
//! - [`iop`]: scoped operation handles
//! - [`fd`]: owning descriptor handle
//! - [`starter`]: detached-task ownership
//! - [`accept`]: lazy stream of inbound connections
//! - [`error`]: error types
//! - [`test_utils`]: logging bootstrap for tests

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod accept;
pub mod error;
pub mod fd;
pub mod iop;
pub mod starter;
pub mod test_utils;
pub mod warden;

mod completion;
mod exec;
mod ready;
mod sys;
mod timer;

pub use accept::AcceptStream;
pub use error::{Error, ErrorKind, Result};
pub use exec::TaskHandle;
pub use fd::FdHandle;
pub use iop::{Iop, OpOutput};
pub use starter::Starter;
pub use warden::{PollWarden, UringWarden, Warden};
