pub mod follower;
pub mod historical;
pub mod processing;
pub mod retrieval;
pub mod round_checker;
pub mod unchecked;
