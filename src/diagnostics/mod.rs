//! Failure-path diagnostics. Nothing in here runs on the happy path.

pub mod stack;

pub use stack::{PanicReport, StackCapture, install_panic_capture, take_last_panic};
