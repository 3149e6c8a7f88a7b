//! Strict JSON codec for Neurite.
//!
//! The object store and every client-facing endpoint exchange JSON, and the
//! bytes they exchange come from untrusted peers. This crate provides a
//! decoder that is deliberately stricter than general-purpose parsers:
//!
//! - raw control bytes (≤ `0x1F`) inside strings are rejected,
//! - `\u0000` escapes are silently dropped rather than embedded,
//! - UTF-16 surrogate escapes must form a valid pair,
//! - numbers have no exponent form,
//! - duplicate object keys keep the value seen last.
//!
//! Values are plain [`serde_json::Value`] trees (built with `preserve_order`,
//! so object key order survives a round-trip). Three encoders are provided:
//! compact (the default wire form), pretty (2-space indent), and canonical
//! (lexicographically sorted keys, used wherever signatures are computed).
//!
//! [`estimate_size`] walks a tree and returns the approximate number of heap
//! bytes it occupies; the object store uses it for cache accounting.

mod decode;
mod encode;
mod size;

pub use decode::{decode, decode_object, JsonError, JsonErrorKind};
pub use encode::{encode, encode_canonical, encode_pretty};
pub use size::estimate_size;

pub use serde_json::{Map, Value};
