//! Concrete `Api` implementations. The dummy backend is always compiled;
//! native backends are opt-in cargo features.

pub mod dummy;

#[cfg(feature = "cpal")]
pub mod cpal;

use crate::audio::registry::BackendEntry;

pub use dummy::{DummyApi, DummyController, Pacing};

/// Backends compiled into this build, in automatic-selection order.
/// The dummy backend is always last.
pub fn compiled_entries() -> Vec<BackendEntry> {
    let mut entries = Vec::new();
    #[cfg(feature = "cpal")]
    entries.extend(cpal::entries());
    entries.push(dummy::entry());
    entries
}
