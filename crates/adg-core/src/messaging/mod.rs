//! Outbound messaging port, the inbound message model, and the throttling decorator.

pub mod port;
pub mod throttled;
pub mod types;
