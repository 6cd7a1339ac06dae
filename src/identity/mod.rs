pub mod identity_tracker;
