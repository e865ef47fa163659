#![forbid(unsafe_code)]
#![doc = "Bounds-checked TLS wire encoding helpers for tlsengine."]

pub mod wire;

pub use wire::*;
