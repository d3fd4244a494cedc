//! Event handling module
//!
//! Provides dispatch envelope serialization for the message broker.

pub mod serialize;

pub use serialize::{envelope, DispatchEnvelope};
