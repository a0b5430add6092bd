//! signal_mix: core library for the radio mixing console.
//!
//! Channel strips, buses, stream sources and per-bus recorders all live
//! here behind `MixEngine`. The CLI consumes this crate.

pub mod bus;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod device;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod export;
pub mod graph;
pub mod input;
pub mod onair;
pub mod ramp;
pub mod recording;
pub mod runtime;
pub mod schedule;
pub mod stream;
pub mod tap;

pub use bus::BusId;
pub use config::MixConfig;
pub use dsp::EqBand;
pub use engine::{MixEngine, MixEvent};
pub use error::{BindFailure, MixError, Result};
pub use recording::ExportFormat;
pub use stream::StreamState;
