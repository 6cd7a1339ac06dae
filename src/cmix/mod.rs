pub mod params;
pub mod round_sender;
