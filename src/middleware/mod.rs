//! Composable Axum layers attached to the router by the binary.

pub mod recovery;
pub mod request_id;

pub use recovery::create_recovery_middleware;
pub use request_id::request_id_middleware;
