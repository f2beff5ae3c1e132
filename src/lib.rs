// src/lib.rs - knithost library surface
pub mod config;
pub mod debounce;
pub mod hardware;
pub mod knit;
pub mod needles;
pub mod pattern;
pub mod pnm;
pub mod server;
pub mod sled;
pub mod sync;
