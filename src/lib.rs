//! Real-time audio input/output over interchangeable backends.
//!
//! An [`Interface`] selects one backend, enumerates its devices and runs at
//! most one stream whose callback is invoked once per quantum on the
//! backend's thread.

pub mod audio;
pub mod cli;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod logging;
pub mod models;


pub use audio::{
    DeviceInfo, Flags, Interface, StreamCallback, StreamOptions, StreamParameters,
};
pub use error::{OrchestraError, Result};
pub use models::*;
