#![forbid(unsafe_code)]
#![doc = "Common types, error codes, alert descriptions and algorithm identifiers for tlsengine."]

pub mod alert;
pub mod algorithm;
pub mod error;

pub use alert::*;
pub use algorithm::*;
pub use error::*;
