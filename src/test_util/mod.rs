//! Utilities for testing code based on the network engine: a scripted gateway transport and
//!  factories for IDs, NDFs, rounds and identities. They are used by the crate's own tests, and
//!  they are exported for application testing.

pub mod comms;
pub mod identity;
pub mod ndf;
pub mod round;
