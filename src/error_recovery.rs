use log::info;

use crate::audio::DeviceInfo;
use crate::models::{Mode, SampleFormat};

/// One direction of a stream request as a tool or application states it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub device_id: usize,
    pub channels: u32,
    pub first_channel: u32,
    pub sample_rate: u32,
    pub format: SampleFormat,
}

impl StreamRequest {
    /// Bytes of one interleaved frame
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.format.bytes()
    }
}

/// Outcome of fitting a request to a device
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryResult {
    /// The request already fits
    Unchanged,
    /// A valid request, with a description of every change
    Adjusted(StreamRequest, Vec<String>),
    /// Nothing close enough exists on this device
    Failed(String),
}

impl RecoveryResult {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, RecoveryResult::Unchanged)
    }

    pub fn is_adjusted(&self) -> bool {
        matches!(self, RecoveryResult::Adjusted(..))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RecoveryResult::Failed(_))
    }

    /// The request to retry with, if any
    pub fn request(&self) -> Option<&StreamRequest> {
        match self {
            RecoveryResult::Adjusted(request, _) => Some(request),
            _ => None,
        }
    }
}

/// Helpers that turn an `InvalidParameter` failure into a request the
/// device accepts.
pub struct RecoveryUtils;

impl RecoveryUtils {
    /// Closest rate in `supported`; ties go to the higher rate
    pub fn nearest_supported_sample_rate(sample_rate: u32, supported: &[u32]) -> Option<u32> {
        supported
            .iter()
            .copied()
            .min_by_key(|&rate| ((i64::from(rate) - i64::from(sample_rate)).abs(), u32::MAX - rate))
    }

    /// Fit `(channels, first_channel)` into `max` device channels, keeping
    /// the channel count when possible. `None` when the device has none.
    pub fn clamp_channels(channels: u32, first_channel: u32, max: u32) -> Option<(u32, u32)> {
        if max == 0 {
            return None;
        }
        let channels = channels.clamp(1, max);
        let first_channel = first_channel.min(max - channels);
        Some((channels, first_channel))
    }

    /// Adjust channels and sample rate of `request` to what `device` offers
    /// in `mode`. The sample format is left alone since the interface
    /// converts non-native formats.
    pub fn suggest_request(device: &DeviceInfo, mode: Mode, request: &StreamRequest) -> RecoveryResult {
        let mut adjusted = *request;
        adjusted.device_id = device.id;
        let mut changes = Vec::new();

        let Some((channels, first_channel)) = Self::clamp_channels(
            request.channels,
            request.first_channel,
            device.max_channels(mode),
        ) else {
            return RecoveryResult::Failed(format!(
                "'{}' has no {} channels",
                device.name, mode
            ));
        };
        if channels != request.channels {
            changes.push(format!("channels {} -> {}", request.channels, channels));
        }
        if first_channel != request.first_channel {
            changes.push(format!(
                "first channel {} -> {}",
                request.first_channel, first_channel
            ));
        }
        adjusted.channels = channels;
        adjusted.first_channel = first_channel;

        if !device.sample_rates.is_empty() && !device.supports_sample_rate(request.sample_rate) {
            let rate = if request.sample_rate == 0 {
                Some(device.preferred_sample_rate).filter(|rate| *rate > 0)
            } else {
                Self::nearest_supported_sample_rate(request.sample_rate, &device.sample_rates)
            };
            match rate {
                Some(rate) => {
                    changes.push(format!("sample rate {} -> {} Hz", request.sample_rate, rate));
                    adjusted.sample_rate = rate;
                }
                None => {
                    return RecoveryResult::Failed(format!(
                        "'{}' reports no usable sample rate",
                        device.name
                    ))
                }
            }
        }

        if changes.is_empty() && adjusted == *request {
            RecoveryResult::Unchanged
        } else {
            info!("adjusted stream request for '{}': {}", device.name, changes.join(", "));
            RecoveryResult::Adjusted(adjusted, changes)
        }
    }

    /// Device names as typed on a command line
    pub fn is_valid_device_name(device_name: &str) -> bool {
        !device_name.trim().is_empty() && device_name.len() < 256 && !device_name.contains('\0')
    }

    pub fn sanitize_device_name(device_name: &str) -> String {
        device_name
            .chars()
            .filter(|c| !c.is_control())
            .take(255)
            .collect::<String>()
            .trim()
            .to_string()
    }
}
