//! Core types shared across the Neurite homeserver.

mod error;
mod id;
mod util;

pub use error::{Errcode, MatrixError};
pub use id::{
    parse_common_id, valid_common_id, validate_localpart, validate_localpart_historical, UserId,
};
pub use util::{now_ms, random_string};
