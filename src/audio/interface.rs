//! The application-facing object: owns one backend and at most one stream.

use log::{debug, warn};

use crate::audio::convert::{ConversionPlan, FormatAdapter};
use crate::audio::device::DeviceInfo;
use crate::audio::registry::BackendRegistry;
use crate::audio::stream::{Flags, StreamOptions, StreamParameters};
use crate::audio::{Api, StreamCallback};
use crate::error::{OrchestraError, Result};
use crate::logging::StreamLogger;
use crate::models::{ApiType, CallbackResult, Mode, SampleFormat, StreamState, StreamStatus};

/// What the interface remembers about the open stream
#[derive(Debug, Clone, Copy)]
struct StreamRecord {
    mode: Mode,
    user_format: SampleFormat,
    device_format: SampleFormat,
    buffer_frames: u32,
    output_plan: Option<ConversionPlan>,
    input_plan: Option<ConversionPlan>,
}

impl StreamRecord {
    fn wrap(&self, callback: Box<dyn StreamCallback>) -> Box<dyn StreamCallback> {
        let adapter = FormatAdapter::new(callback, self.output_plan, self.input_plan);
        if adapter.is_passthrough() {
            adapter.into_inner()
        } else {
            Box::new(adapter)
        }
    }
}

/// Unified entry point over the compiled backends.
///
/// Control calls are expected from one thread at a time. The callback runs
/// on the backend's real-time thread and only ever sees buffers in the
/// format and layout requested at `open_stream`.
pub struct Interface {
    registry: BackendRegistry,
    api: Option<Box<dyn Api>>,
    record: Option<StreamRecord>,
    logger: StreamLogger,
    last_xruns: u64,
}

impl Interface {
    /// Interface over the compiled backends with none selected yet
    pub fn new() -> Self {
        Self::with_registry(BackendRegistry::compiled())
    }

    pub fn with_registry(registry: BackendRegistry) -> Self {
        Self {
            registry,
            api: None,
            record: None,
            logger: StreamLogger::new(),
            last_xruns: 0,
        }
    }

    /// Interface bound to an already constructed backend
    pub fn with_api(api: Box<dyn Api>) -> Self {
        let mut interface = Self::new();
        interface.attach(api);
        interface
    }

    /// Interface with a backend selected as by [`Interface::instantiate`]
    pub fn with_backend(preferred: Option<ApiType>) -> Result<Self> {
        let mut interface = Self::new();
        interface.instantiate(preferred)?;
        Ok(interface)
    }

    fn attach(&mut self, mut api: Box<dyn Api>) {
        let count = api.device_count();
        self.logger.log_backend_selected(api.api_type(), count);
        self.api = Some(api);
        self.last_xruns = 0;
    }

    fn api_mut(&mut self) -> Result<&mut Box<dyn Api>> {
        self.api
            .as_mut()
            .ok_or_else(|| OrchestraError::InvalidState("no backend instantiated".to_string()))
    }

    /// Tags of the compiled backends in automatic-selection order
    pub fn list_api(&self) -> Vec<ApiType> {
        self.registry.api_types()
    }

    /// Select a backend, closing any stream of the current one first
    pub fn instantiate(&mut self, preferred: Option<ApiType>) -> Result<()> {
        self.clear()?;
        let api = self.registry.select(preferred)?;
        self.attach(api);
        Ok(())
    }

    /// Close any stream and release the backend
    pub fn clear(&mut self) -> Result<()> {
        self.close_stream()?;
        self.api = None;
        Ok(())
    }

    pub fn current_api(&self) -> ApiType {
        self.api
            .as_ref()
            .map(|api| api.api_type())
            .unwrap_or(ApiType::Undefined)
    }

    pub fn device_count(&mut self) -> usize {
        self.api.as_mut().map(|api| api.device_count()).unwrap_or(0)
    }

    pub fn device_info(&mut self, index: usize) -> Result<DeviceInfo> {
        self.api_mut()?.device_info(index)
    }

    pub fn probe_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        self.api_mut()?.probe_devices()
    }

    pub fn default_input_device(&mut self) -> Option<usize> {
        self.api.as_mut().and_then(|api| api.default_input_device())
    }

    pub fn default_output_device(&mut self) -> Option<usize> {
        self.api.as_mut().and_then(|api| api.default_output_device())
    }

    pub fn default_input_info(&mut self) -> Result<Option<DeviceInfo>> {
        match self.default_input_device() {
            Some(index) => self.device_info(index).map(Some),
            None => Ok(None),
        }
    }

    pub fn default_output_info(&mut self) -> Result<Option<DeviceInfo>> {
        match self.default_output_device() {
            Some(index) => self.device_info(index).map(Some),
            None => Ok(None),
        }
    }

    /// Index of the device called `name`; an exact match wins over a
    /// case-insensitive substring match.
    pub fn device_index_by_name(&mut self, name: &str) -> Result<usize> {
        let devices = self.probe_devices()?;
        let needle = name.to_lowercase();
        devices
            .iter()
            .position(|device| device.name == name)
            .or_else(|| {
                devices
                    .iter()
                    .position(|device| device.name.to_lowercase().contains(&needle))
            })
            .ok_or_else(|| OrchestraError::InvalidParameter(format!("no device named '{}'", name)))
    }

    /// Open a stream whose callback is a closure.
    ///
    /// `buffer_frames` is the requested quantum size on entry and the
    /// negotiated one on return. On failure the stream stays `Closed`.
    #[allow(clippy::too_many_arguments)]
    pub fn open_stream<F>(
        &mut self,
        output: Option<&StreamParameters>,
        input: Option<&StreamParameters>,
        format: SampleFormat,
        sample_rate: u32,
        buffer_frames: &mut u32,
        options: &StreamOptions,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(Option<&mut [u8]>, Option<&[u8]>, u32, f64, StreamStatus) -> CallbackResult
            + Send
            + 'static,
    {
        self.open_stream_boxed(
            output,
            input,
            format,
            sample_rate,
            buffer_frames,
            options,
            Box::new(callback),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open_stream_boxed(
        &mut self,
        output: Option<&StreamParameters>,
        input: Option<&StreamParameters>,
        format: SampleFormat,
        sample_rate: u32,
        buffer_frames: &mut u32,
        options: &StreamOptions,
        callback: Box<dyn StreamCallback>,
    ) -> Result<()> {
        if self.api.is_none() {
            return Err(OrchestraError::InvalidState(
                "no backend instantiated".to_string(),
            ));
        }
        if self.stream_state() != StreamState::Closed {
            return Err(OrchestraError::InvalidState(
                "a stream is already open".to_string(),
            ));
        }
        let mode = Mode::from_directions(output.is_some(), input.is_some()).ok_or_else(|| {
            OrchestraError::InvalidParameter(
                "at least one of output or input parameters is required".to_string(),
            )
        })?;

        let mut devices = Vec::with_capacity(2);
        if let Some(params) = output {
            devices.push(self.check_direction(params, Mode::Output, sample_rate)?);
        }
        if let Some(params) = input {
            devices.push(self.check_direction(params, Mode::Input, sample_rate)?);
        }
        if let (Some(out), Some(inp)) = (output, input) {
            if out.device_id == inp.device_id {
                let limit = devices[0].max_channels(Mode::Duplex);
                let needed = out.device_channels().max(inp.device_channels());
                if needed > limit {
                    return Err(OrchestraError::InvalidParameter(format!(
                        "'{}' supports {} duplex channel(s), {} requested",
                        devices[0].name, limit, needed
                    )));
                }
            }
        }
        let device_format = negotiate_format(format, &devices)?;

        let interleaved = !options.flags.contains(Flags::NON_INTERLEAVED);
        let output_plan = output.map(|p| ConversionPlan::new(format, device_format, p, interleaved));
        let input_plan = input.map(|p| ConversionPlan::new(format, device_format, p, interleaved));
        let record = StreamRecord {
            mode,
            user_format: format,
            device_format,
            buffer_frames: *buffer_frames,
            output_plan,
            input_plan,
        };

        let device_output = output.map(|p| StreamParameters::new(p.device_id, p.device_channels()));
        let device_input = input.map(|p| StreamParameters::new(p.device_id, p.device_channels()));
        let device_options = StreamOptions {
            flags: options.flags.without(Flags::NON_INTERLEAVED),
            ..options.clone()
        };
        if device_format != format {
            debug!("converting {} <-> native {}", format, device_format);
        }

        let callback = record.wrap(callback);
        let api = self.api_mut()?;
        if let Err(e) = api.open_stream(
            device_output.as_ref(),
            device_input.as_ref(),
            device_format,
            sample_rate,
            buffer_frames,
            &device_options,
            callback,
        ) {
            let _ = api.close_stream();
            self.logger.log_stream_error(&e.to_string());
            return Err(e);
        }

        self.record = Some(StreamRecord {
            buffer_frames: *buffer_frames,
            ..record
        });
        self.last_xruns = 0;
        self.logger
            .log_stream_opened(mode, format, sample_rate, *buffer_frames);
        Ok(())
    }

    fn check_direction(
        &mut self,
        params: &StreamParameters,
        mode: Mode,
        sample_rate: u32,
    ) -> Result<DeviceInfo> {
        if params.n_channels == 0 {
            return Err(OrchestraError::InvalidParameter(
                "channel count must be at least 1".to_string(),
            ));
        }
        let count = self.device_count();
        if params.device_id >= count {
            return Err(OrchestraError::InvalidParameter(format!(
                "device index {} out of range ({} devices)",
                params.device_id, count
            )));
        }
        let info = self.device_info(params.device_id)?;
        let limit = info.max_channels(mode);
        if params.device_channels() > limit {
            return Err(OrchestraError::InvalidParameter(format!(
                "'{}' supports {} {} channel(s), {} requested from channel {}",
                info.name, limit, mode, params.n_channels, params.first_channel
            )));
        }
        if sample_rate == 0
            || (!info.sample_rates.is_empty() && !info.supports_sample_rate(sample_rate))
        {
            return Err(OrchestraError::InvalidParameter(format!(
                "'{}' does not support {} Hz",
                info.name, sample_rate
            )));
        }
        Ok(info)
    }

    pub fn start_stream(&mut self) -> Result<()> {
        match self.stream_state() {
            StreamState::Running => Ok(()),
            StreamState::Open | StreamState::Stopped => {
                self.api_mut()?.start_stream()?;
                self.logger.log_stream_started();
                Ok(())
            }
            state => Err(invalid_for(state, "start")),
        }
    }

    /// Orderly stop; returns once the quantum in flight has finished
    pub fn stop_stream(&mut self) -> Result<()> {
        self.halt(false)
    }

    /// Immediate stop without draining queued output
    pub fn abort_stream(&mut self) -> Result<()> {
        self.halt(true)
    }

    fn halt(&mut self, abort: bool) -> Result<()> {
        let state = self.stream_state();
        match state {
            StreamState::Open => Ok(()),
            StreamState::Running | StreamState::Stopped => {
                let api = self.api_mut()?;
                if abort {
                    api.abort_stream()?;
                } else {
                    api.stop_stream()?;
                }
                self.observe();
                if state == StreamState::Running {
                    let time = self.stream_time();
                    if abort {
                        self.logger.log_stream_aborted(time);
                    } else {
                        self.logger.log_stream_stopped(time);
                    }
                }
                Ok(())
            }
            _ => {
                self.observe();
                Err(invalid_for(state, if abort { "abort" } else { "stop" }))
            }
        }
    }

    /// Release the stream. Valid from every state; a no-op when closed.
    pub fn close_stream(&mut self) -> Result<()> {
        if self.stream_state() == StreamState::Closed {
            return Ok(());
        }
        self.observe();
        let xruns = self.xrun_count();
        self.api_mut()?.close_stream()?;
        self.record = None;
        self.logger.log_stream_closed(xruns);
        Ok(())
    }

    /// Replace the callback of an open stream that is not running
    pub fn set_stream_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(Option<&mut [u8]>, Option<&[u8]>, u32, f64, StreamStatus) -> CallbackResult
            + Send
            + 'static,
    {
        self.set_stream_callback_boxed(Box::new(callback))
    }

    pub fn set_stream_callback_boxed(&mut self, callback: Box<dyn StreamCallback>) -> Result<()> {
        let state = self.stream_state();
        let record = match (state, self.record) {
            (StreamState::Open | StreamState::Stopped, Some(record)) => record,
            _ => return Err(invalid_for(state, "replace the callback of")),
        };
        self.api_mut()?.set_stream_callback(record.wrap(callback))
    }

    /// Report xruns and failures the real-time side left behind
    fn observe(&mut self) {
        let Some(api) = self.api.as_ref() else {
            return;
        };
        let xruns = api.xrun_count();
        if xruns > self.last_xruns {
            self.logger.log_xrun(xruns - self.last_xruns, xruns);
            self.last_xruns = xruns;
        }
        if api.stream_state() == StreamState::Error {
            self.logger
                .log_stream_error("backend could not continue the stream");
        }
    }

    pub fn stream_state(&self) -> StreamState {
        self.api
            .as_ref()
            .map(|api| api.stream_state())
            .unwrap_or(StreamState::Closed)
    }

    pub fn is_stream_open(&self) -> bool {
        self.stream_state().is_open()
    }

    pub fn is_stream_running(&self) -> bool {
        self.api
            .as_ref()
            .map(|api| api.is_stream_running())
            .unwrap_or(false)
    }

    pub fn stream_time(&self) -> f64 {
        self.api.as_ref().map(|api| api.stream_time()).unwrap_or(0.0)
    }

    /// Frames of latency, input plus output for duplex streams
    pub fn stream_latency(&self) -> u64 {
        self.api.as_ref().map(|api| api.stream_latency()).unwrap_or(0)
    }

    pub fn stream_sample_rate(&self) -> u32 {
        self.api
            .as_ref()
            .map(|api| api.stream_sample_rate())
            .unwrap_or(0)
    }

    /// Negotiated quantum size of the open stream
    pub fn buffer_frames(&self) -> Option<u32> {
        self.record.map(|record| record.buffer_frames)
    }

    pub fn stream_mode(&self) -> Option<Mode> {
        self.record.map(|record| record.mode)
    }

    /// (callback format, device format) of the open stream
    pub fn stream_formats(&self) -> Option<(SampleFormat, SampleFormat)> {
        self.record
            .map(|record| (record.user_format, record.device_format))
    }

    pub fn xrun_count(&self) -> u64 {
        self.api.as_ref().map(|api| api.xrun_count()).unwrap_or(0)
    }

    pub fn logger(&self) -> &StreamLogger {
        &self.logger
    }
}

impl Default for Interface {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        if let Err(e) = self.close_stream() {
            warn!("failed to close stream on drop: {}", e);
        }
    }
}

fn invalid_for(state: StreamState, action: &str) -> OrchestraError {
    let reason = match state {
        StreamState::Closed => "no stream is open".to_string(),
        StreamState::Error => "stream is in error state, close it first".to_string(),
        other => format!("stream is {}", other),
    };
    OrchestraError::InvalidState(format!("cannot {} stream: {}", action, reason))
}

/// The requested format when every device takes it natively, otherwise the
/// highest-resolution format they share.
fn negotiate_format(requested: SampleFormat, devices: &[DeviceInfo]) -> Result<SampleFormat> {
    // Devices that could not be probed leave the choice to the backend
    let probed: Vec<&DeviceInfo> = devices
        .iter()
        .filter(|device| !device.native_formats.is_empty())
        .collect();
    if probed.iter().all(|device| device.supports_format(requested)) {
        return Ok(requested);
    }
    SampleFormat::ALL
        .iter()
        .copied()
        .filter(|format| probed.iter().all(|device| device.supports_format(*format)))
        .max_by_key(|format| format.resolution_rank())
        .ok_or_else(|| {
            OrchestraError::unsupported(format!(
                "no native sample format shared by the selected devices for {}",
                requested
            ))
        })
}
