//! Syntactic checks for label fields.
//!
//! Every validator is a pure function that fails fast with a [`ValidationError`]
//! carrying a human-readable reason.

use thiserror::Error;

pub mod cid;
pub mod datetime;
pub mod did;
pub mod uri;
pub mod val;

pub use cid::validate_cid;
pub use datetime::{validate_timestamp, validate_timestamp_at, TimestampRule};
pub use did::validate_did;
#[allow(deprecated)]
pub use uri::{validate_at_uri, validate_uri};
pub use val::validate_val;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(String);

impl ValidationError {
    pub fn new<S: Into<String>>(reason: S) -> Self {
        ValidationError(reason.into())
    }

    pub fn reason(&self) -> &str {
        &self.0
    }
}
