//! Portcullis is a reverse-proxy gateway that fronts a set of backend
//! services with per-route policy: rate limiting, circuit breaking, bearer
//! token auth, client black lists, and panic containment with stack-capture
//! diagnostics.
//!
//! The crate follows a hexagonal layout:
//!
//! * [`core`] holds the routing table and the dispatch pipeline; it does no
//!   I/O of its own.
//! * [`ports`] defines the traits the core depends on.
//! * [`adapters`] provides the concrete implementations wired in by the
//!   binary.
//! * [`middleware`] contains the Axum layers (recovery, request id).
//! * [`diagnostics`] owns the panic hook and stack formatting.

pub mod adapters;
pub mod config;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod middleware;
pub mod ports;
pub mod tracing_setup;

pub use error::GatewayError;
