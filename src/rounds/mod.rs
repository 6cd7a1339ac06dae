pub mod round_cache;
