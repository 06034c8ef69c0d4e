pub mod deterministic_rng;
pub mod image;
