pub mod bloom;
pub mod ephemeral;
pub mod fingerprint;
pub mod id;
pub mod known_rounds;
pub mod message;
pub mod ndf;
pub mod round;
pub mod service;
