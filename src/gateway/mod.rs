pub mod comms;
pub mod host;
pub mod host_pool;
pub mod sender;
