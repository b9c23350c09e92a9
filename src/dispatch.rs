//! Per-subscription message processing.
//!
//! [`Dispatcher`] runs the decode, validate, attach-topic and act steps for
//! one message; [`DispatchRuntime`] owns the broker subscription and feeds
//! it messages one at a time.

pub mod dispatcher;
pub mod retry_runner;
pub mod runtime;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use runtime::{DispatchRuntime, RuntimeState};
