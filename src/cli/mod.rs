use clap::{Args, Parser};
use log::warn;
use std::time::Duration;

use crate::audio::{Flags, Interface, StreamOptions};
use crate::config::{ConfigManager, OrchestraConfig};
use crate::error::{OrchestraError, ToolError};
use crate::error_recovery::{RecoveryUtils, StreamRequest};
use crate::models::{ApiType, Mode, SampleFormat};

pub mod pipe;
pub mod status;


pub use pipe::{run_capture, run_playback, PipeReport};
pub use status::{collect_listing, BackendListing, DeviceListing};

/// List the audio devices of the compiled backends
#[derive(Debug, Parser)]
#[command(name = "orchestra-list")]
#[command(about = "List the audio devices of every compiled backend")]
#[command(version)]
pub struct ListArgs {
    /// Only list this backend (alsa, pulse, jack, coreOSX, asio, ds, dummy, ...)
    #[arg(long)]
    pub api: Option<ApiType>,

    /// Print machine-readable JSON instead of text
    #[arg(long)]
    pub json: bool,

    /// Remember --api as the preferred backend of the other tools
    #[arg(long, requires = "api")]
    pub save: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Options shared by the streaming tools
#[derive(Debug, Clone, Args)]
pub struct StreamArgs {
    /// Backend tag; automatic selection when omitted
    #[arg(long)]
    pub api: Option<ApiType>,

    /// Device index or name; the default device when omitted
    #[arg(short, long)]
    pub device: Option<String>,

    /// Number of channels
    #[arg(short, long)]
    pub channels: Option<u32>,

    /// Sample rate in Hz
    #[arg(short, long)]
    pub rate: Option<u32>,

    /// Frames per quantum
    #[arg(long)]
    pub frames: Option<u32>,

    /// Sample format of the piped data (s8, s16, s24, s32, f32, f64)
    #[arg(short, long)]
    pub format: Option<SampleFormat>,

    /// Number of buffers
    #[arg(long)]
    pub buffers: Option<u32>,

    /// First device channel
    #[arg(long, default_value_t = 0)]
    pub first_channel: u32,

    /// Ask the backend for the smallest buffers it allows
    #[arg(long)]
    pub minimize_latency: bool,

    /// Retry with the closest request the device supports
    #[arg(long)]
    pub fallback: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Play raw samples from standard input
#[derive(Debug, Parser)]
#[command(name = "orchestra-out")]
#[command(about = "Play raw interleaved samples read from standard input")]
#[command(version)]
pub struct OutArgs {
    #[command(flatten)]
    pub stream: StreamArgs,
}

/// Record raw samples to standard output
#[derive(Debug, Parser)]
#[command(name = "orchestra-in")]
#[command(about = "Record raw interleaved samples to standard output")]
#[command(version)]
pub struct InArgs {
    #[command(flatten)]
    pub stream: StreamArgs,

    /// Stop after this many seconds
    #[arg(long)]
    pub duration: Option<f64>,
}

/// How the user named a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    Index(usize),
    Name(String),
}

impl DeviceSelector {
    pub fn parse(value: &str) -> Result<Self, ToolError> {
        if let Ok(index) = value.trim().parse::<usize>() {
            return Ok(DeviceSelector::Index(index));
        }
        if !RecoveryUtils::is_valid_device_name(value) {
            return Err(ToolError::Usage(format!("invalid device name '{}'", value)));
        }
        Ok(DeviceSelector::Name(RecoveryUtils::sanitize_device_name(value)))
    }
}

/// A stream request with every default filled in
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub api: Option<ApiType>,
    pub device: Option<DeviceSelector>,
    pub channels: u32,
    pub first_channel: u32,
    pub sample_rate: u32,
    pub buffer_frames: u32,
    pub number_of_buffers: u32,
    pub format: SampleFormat,
    pub minimize_latency: bool,
    pub fallback: bool,
}

impl StreamSettings {
    pub fn options(&self) -> StreamOptions {
        let mut options = StreamOptions {
            number_of_buffers: self.number_of_buffers,
            stream_name: "orchestra".to_string(),
            ..StreamOptions::default()
        };
        if self.minimize_latency {
            options.flags |= Flags::MINIMIZE_LATENCY;
        }
        options
    }

    /// Bytes of one interleaved frame on the pipe
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.format.bytes()
    }

    pub fn request(&self, device_id: usize) -> StreamRequest {
        StreamRequest {
            device_id,
            channels: self.channels,
            first_channel: self.first_channel,
            sample_rate: self.sample_rate,
            format: self.format,
        }
    }

    /// Device index to use for `mode`
    pub fn resolve_device(&self, interface: &mut Interface, mode: Mode) -> Result<usize, ToolError> {
        match &self.device {
            Some(DeviceSelector::Index(index)) => Ok(*index),
            Some(DeviceSelector::Name(name)) => Ok(interface.device_index_by_name(name)?),
            None => {
                let default = if mode.has_output() {
                    interface.default_output_device()
                } else {
                    interface.default_input_device()
                };
                default.ok_or_else(|| {
                    ToolError::Audio(OrchestraError::DeviceUnavailable(format!(
                        "no default {} device on backend '{}'",
                        mode,
                        interface.current_api()
                    )))
                })
            }
        }
    }
}

impl StreamArgs {
    /// Command-line values, then configuration values
    pub fn resolve(&self, config: &OrchestraConfig) -> Result<StreamSettings, ToolError> {
        let device = self.device.as_deref().map(DeviceSelector::parse).transpose()?;
        let settings = StreamSettings {
            api: self.api.or_else(|| config.preferred_api_type()),
            device,
            channels: self.channels.unwrap_or(config.channels),
            first_channel: self.first_channel,
            sample_rate: self.rate.unwrap_or(config.sample_rate),
            buffer_frames: self.frames.unwrap_or(config.buffer_frames),
            number_of_buffers: self.buffers.unwrap_or(config.number_of_buffers),
            format: self.format.unwrap_or(config.format),
            minimize_latency: self.minimize_latency || config.minimize_latency,
            fallback: self.fallback,
        };
        if settings.channels == 0 {
            return Err(ToolError::Usage("--channels must be at least 1".to_string()));
        }
        Ok(settings)
    }

    pub fn log_level<'a>(&'a self, config: &'a OrchestraConfig) -> Option<&'a str> {
        self.log_level.as_deref().or(config.log_level.as_deref())
    }
}

impl InArgs {
    pub fn duration(&self) -> Result<Option<Duration>, ToolError> {
        match self.duration {
            None => Ok(None),
            Some(seconds) if seconds > 0.0 => Duration::try_from_secs_f64(seconds)
                .map(Some)
                .map_err(|e| {
                    ToolError::Usage(format!("--duration {} is out of range: {}", seconds, e))
                }),
            Some(seconds) => Err(ToolError::Usage(format!(
                "--duration must be a positive number of seconds, got {}",
                seconds
            ))),
        }
    }
}

/// User configuration, or defaults when it cannot be read
pub fn load_config() -> OrchestraConfig {
    match ConfigManager::new() {
        Ok(manager) => manager.get_config().clone(),
        Err(e) => {
            warn!("{}; using built-in defaults", e.user_message());
            OrchestraConfig::default()
        }
    }
}

/// Print a tool error with its suggestions to stderr
pub fn report_error(tool: &str, error: &ToolError) {
    log::log!(error.severity().log_level(), "{}: {}", tool, error);
    eprintln!("{}: {}", tool, error.user_message());
    for suggestion in error.recovery_suggestions() {
        eprintln!("  - {}", suggestion);
    }
}
