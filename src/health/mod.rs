pub mod health_tracker;
