//! The _coral_ library crate.
//!
//! Coral is the operational engine of an RPKI certificate authority: a
//! cooperative task scheduler that reconciles the CA's issued objects
//! against externally supplied desired state and publishes the resulting
//! deltas to a repository server.

pub mod commons;
pub mod constants;
pub mod daemon;
pub mod runtime;
pub mod test;
