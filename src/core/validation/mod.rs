//! Validation primitives attached to model fields
//!
//! Each field carries a list of [`Validator`]s. They run during finalisation, after
//! generators have filled absent values and before converters normalise them.

pub mod validators;

pub use validators::{ValidationFailure, Validator};
