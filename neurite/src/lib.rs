//! The Neurite homeserver: configuration, the user/token data model, the
//! user-interactive-authentication state machine, and the client-server
//! request handlers.
//!
//! The binary in `main.rs` wires these onto the listener stack; everything
//! here is also exercised directly by the integration tests.

pub mod auth;
pub mod config;
pub mod regtoken;
pub mod routes;
pub mod state;
pub mod uia;
pub mod users;

use neurite_core::{Errcode, MatrixError};

/// Map an infrastructure failure onto the wire as `M_UNKNOWN`/500, logging
/// the real cause. Handlers use this for everything that is not the
/// client's fault.
pub fn internal(err: impl std::fmt::Display) -> MatrixError {
    tracing::error!(error = %err, "internal error");
    MatrixError::new(Errcode::Unknown)
}
