use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{Mode, SampleFormat};

/// Standard rates probed against hardware ranges
pub const GENERIC_SAMPLE_RATES: [u32; 17] = [
    4000, 5512, 8000, 9600, 11025, 16000, 22050, 32000, 44100, 48000, 64000, 88200, 96000,
    128000, 176400, 192000, 256000,
];

pub fn generic_sample_rates() -> &'static [u32] {
    &GENERIC_SAMPLE_RATES
}

/// Generic rates within `[min, max]`, ascending
pub fn rates_in_range(min: u32, max: u32) -> Vec<u32> {
    GENERIC_SAMPLE_RATES
        .iter()
        .copied()
        .filter(|rate| (min..=max).contains(rate))
        .collect()
}

/// 48 kHz when available, then 44.1 kHz, otherwise the highest rate
pub fn preferred_rate(rates: &[u32]) -> u32 {
    [48000, 44100]
        .into_iter()
        .find(|rate| rates.contains(rate))
        .or_else(|| rates.iter().copied().max())
        .unwrap_or(0)
}

/// Snapshot of a device's capabilities.
///
/// Returned by value; it goes stale when the hardware set changes and there
/// is no notification for that, so callers re-probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Backend-scoped handle, equal to the enumeration index
    pub id: usize,
    /// Capabilities were probed successfully
    pub probed: bool,
    pub name: String,
    pub output_channels: u32,
    pub input_channels: u32,
    pub duplex_channels: u32,
    pub is_default_output: bool,
    pub is_default_input: bool,
    pub sample_rates: Vec<u32>,
    pub preferred_sample_rate: u32,
    pub native_formats: Vec<SampleFormat>,
}

impl DeviceInfo {
    /// Placeholder for a device that exists but could not be queried
    pub fn unprobed(id: usize, name: impl Into<String>) -> Self {
        Self {
            id,
            probed: false,
            name: name.into(),
            output_channels: 0,
            input_channels: 0,
            duplex_channels: 0,
            is_default_output: false,
            is_default_input: false,
            sample_rates: Vec::new(),
            preferred_sample_rate: 0,
            native_formats: Vec::new(),
        }
    }

    /// Channel ceiling for streams in `mode`
    pub fn max_channels(&self, mode: Mode) -> u32 {
        match mode {
            Mode::Output => self.output_channels,
            Mode::Input => self.input_channels,
            Mode::Duplex => self.duplex_channels,
        }
    }

    pub fn supports_mode(&self, mode: Mode) -> bool {
        self.max_channels(mode) > 0
    }

    pub fn supports_sample_rate(&self, sample_rate: u32) -> bool {
        self.sample_rates.contains(&sample_rate)
    }

    pub fn supports_format(&self, format: SampleFormat) -> bool {
        self.native_formats.contains(&format)
    }

    /// Native format preserving the most resolution
    pub fn best_native_format(&self) -> Option<SampleFormat> {
        self.native_formats
            .iter()
            .copied()
            .max_by_key(|format| format.resolution_rank())
    }

    /// Multi-line description indented by `tabs` levels of four spaces
    pub fn display(&self, tabs: usize) -> String {
        let space = "    ".repeat(tabs);
        let plural = |count: usize| if count > 1 { "s" } else { "" };
        let rates: Vec<String> = self.sample_rates.iter().map(u32::to_string).collect();
        let formats: Vec<&str> = self.native_formats.iter().map(|f| f.as_str()).collect();

        let mut lines = vec![
            format!("{}name={}", space, self.name),
            format!("{}probed={}", space, self.probed),
            format!(
                "{}channels: output={} input={} duplex={}",
                space, self.output_channels, self.input_channels, self.duplex_channels
            ),
            format!(
                "{}rate{}=[{}] preferred={}",
                space,
                plural(rates.len()),
                rates.join(", "),
                self.preferred_sample_rate
            ),
            format!(
                "{}native format{}: [{}]",
                space,
                plural(formats.len()),
                formats.join(", ")
            ),
        ];
        let mut defaults = Vec::new();
        if self.is_default_output {
            defaults.push("output");
        }
        if self.is_default_input {
            defaults.push("input");
        }
        if !defaults.is_empty() {
            lines.push(format!("{}default={}", space, defaults.join("+")));
        }
        lines.join("\n")
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{name={}, channels={}/{}/{}, rates={:?}, native formats={:?}}}",
            self.name,
            self.output_channels,
            self.input_channels,
            self.duplex_channels,
            self.sample_rates,
            self.native_formats
        )
    }
}
