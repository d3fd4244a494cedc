//! NATS integration
//!
//! Publishes worker dispatches to NATS subjects.

mod publisher;

pub use publisher::{route_subject, NatsSink};
