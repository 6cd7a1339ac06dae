pub mod fingerprints;
pub mod handler;
pub mod processor;
pub mod services;
