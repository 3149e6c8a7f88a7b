//! HTTP listener stack for the Neurite homeserver.
//!
//! A [`Listener`] binds one configured port (plain TCP or TLS) and drives
//! accepted connections through an `axum::Router`. Concurrency is bounded:
//! a connection is only accepted while one of `max_connections` permits is
//! free, so overload is shed at the kernel backlog instead of piling up
//! worker state.
//!
//! [`dispatch`] wraps an application router with the cross-cutting behavior
//! every Matrix endpoint shares: standard response headers, the `OPTIONS`
//! short-circuit, per-request logging, and the JSON 404 fallback.

mod layers;
mod listener;

pub use layers::dispatch;
pub use listener::{Listener, ListenerConfig, TlsConfig};
