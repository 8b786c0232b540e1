//! Adapters: concrete implementations of the ports, wired in by the binary.

pub mod auth;
pub mod http_client;
pub mod trace_sink;

pub use auth::BearerTokenAuthenticator;
pub use http_client::HttpClientAdapter;
pub use trace_sink::TracingSink;
