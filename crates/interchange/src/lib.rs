//! sieve-interchange: policy document interchange types and deserialization.
//!
//! Policy documents arrive as JSON abstract syntax: every node carries a
//! `kind` tag. This crate turns that JSON into the typed [`PolicyDocument`]
//! tree the evaluator walks. It performs the load-time checks that do not
//! need a subscription (unique policy names, reserved identifiers, filter
//! and sub-template exclusivity).

pub mod deserialize;
pub mod types;

pub use deserialize::{
    bundle_from_interchange, from_interchange, parse_expression, parse_step, InterchangeError,
};
pub use types::*;
