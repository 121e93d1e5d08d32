//! A reference-counted shared pointer built from an owned payload pointer and a separately
//! allocated atomic counter, plus the configuration of the `stress` driver that exercises it
//! from many threads.

mod handle;

pub mod config;

pub use handle::SharedHandle;
