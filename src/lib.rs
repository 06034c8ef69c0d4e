//! Candle-Wan: Wan2.1 video diffusion sampling for the Candle framework.
//!
//! Drives an external diffusion transformer, text/image encoders and video
//! autoencoder through flow-matching UniPC sampling with classifier-free
//! guidance, and builds the matching training forward inputs.

pub mod config;
pub mod latents_bin;
pub mod models;
pub mod utils;

pub use models::wan::*;
