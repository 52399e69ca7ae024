//! Native backends over `cpal` hosts.
//!
//! `cpal` streams may not be `Send`, so every stream lives on a dedicated
//! thread that builds it, plays and pauses it on command and drops it on
//! close. The application callback sits in a slot shared with the data
//! callbacks; the control side only locks it while the stream is idle.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, info, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{RingBuffer, RingConsumer};
use crate::audio::device::{preferred_rate, rates_in_range, DeviceInfo};
use crate::audio::registry::BackendEntry;
use crate::audio::stream::{Flags, StreamOptions, StreamParameters, StreamShared};
use crate::audio::{guarded_process, promote_current_thread, Api, StreamCallback};
use crate::error::{OrchestraError, Result};
use crate::models::{
    ApiType, CallbackResult, Mode, SampleFormat, StatusKind, StreamState, TimestampMode,
};

const DEFAULT_BUFFER_FRAMES: u32 = 256;
const LOW_LATENCY_BUFFER_FRAMES: u32 = 64;
const DEFAULT_NUMBER_OF_BUFFERS: u32 = 4;
const LOW_LATENCY_NUMBER_OF_BUFFERS: u32 = 2;
/// How long a device loss may go unreported before the stream fails anyway
const DEVICE_LOSS_GRACE: Duration = Duration::from_millis(250);

type CallbackSlot = Arc<Mutex<Option<Box<dyn StreamCallback>>>>;

/// Hosts of this platform, in selection order
pub fn entries() -> Vec<BackendEntry> {
    let mut entries = Vec::new();
    #[cfg(target_os = "linux")]
    entries.push(BackendEntry::new(ApiType::Alsa, create_alsa));
    #[cfg(target_os = "macos")]
    entries.push(BackendEntry::new(ApiType::CoreOsx, create_core_audio));
    #[cfg(target_os = "windows")]
    entries.push(BackendEntry::new(ApiType::Wasapi, create_wasapi));
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    entries.push(BackendEntry::new(ApiType::Cpal, create_default));
    entries
}

#[cfg(target_os = "linux")]
fn create_alsa() -> Result<Box<dyn Api>> {
    Ok(Box::new(CpalApi::new(cpal::HostId::Alsa, ApiType::Alsa)?))
}

#[cfg(target_os = "macos")]
fn create_core_audio() -> Result<Box<dyn Api>> {
    Ok(Box::new(CpalApi::new(cpal::HostId::CoreAudio, ApiType::CoreOsx)?))
}

#[cfg(target_os = "windows")]
fn create_wasapi() -> Result<Box<dyn Api>> {
    Ok(Box::new(CpalApi::new(cpal::HostId::Wasapi, ApiType::Wasapi)?))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn create_default() -> Result<Box<dyn Api>> {
    Ok(Box::new(CpalApi::new(cpal::default_host().id(), ApiType::Cpal)?))
}

fn from_cpal_format(format: cpal::SampleFormat) -> Option<SampleFormat> {
    match format {
        cpal::SampleFormat::I8 => Some(SampleFormat::Int8),
        cpal::SampleFormat::I16 => Some(SampleFormat::Int16),
        cpal::SampleFormat::I32 => Some(SampleFormat::Int32),
        cpal::SampleFormat::F32 => Some(SampleFormat::Float32),
        cpal::SampleFormat::F64 => Some(SampleFormat::Float64),
        _ => None,
    }
}

fn to_cpal_format(format: SampleFormat) -> Option<cpal::SampleFormat> {
    match format {
        SampleFormat::Int8 => Some(cpal::SampleFormat::I8),
        SampleFormat::Int16 => Some(cpal::SampleFormat::I16),
        SampleFormat::Int32 => Some(cpal::SampleFormat::I32),
        SampleFormat::Float32 => Some(cpal::SampleFormat::F32),
        SampleFormat::Float64 => Some(cpal::SampleFormat::F64),
        SampleFormat::Int24 => None,
    }
}

fn host(host_id: cpal::HostId) -> Result<cpal::Host> {
    cpal::host_from_id(host_id).map_err(|e| {
        OrchestraError::DriverError(format!("{} host unavailable: {}", host_id.name(), e))
    })
}

fn resolve_device(host_id: cpal::HostId, index: usize) -> Result<cpal::Device> {
    host(host_id)?
        .devices()
        .map_err(|e| OrchestraError::DriverError(format!("failed to enumerate devices: {}", e)))?
        .nth(index)
        .ok_or_else(|| {
            OrchestraError::DeviceUnavailable(format!("device {} is no longer present", index))
        })
}

/// Capabilities of one device from its supported configuration ranges
fn probe_device(index: usize, device: &cpal::Device, defaults: (&str, &str)) -> DeviceInfo {
    let name = device
        .name()
        .unwrap_or_else(|_| format!("Device {}", index));
    let mut info = DeviceInfo::unprobed(index, name);
    let mut rates = Vec::new();
    let mut formats = Vec::new();

    let mut collect = |range: cpal::SupportedStreamConfigRange| -> u32 {
        for rate in rates_in_range(range.min_sample_rate().0, range.max_sample_rate().0) {
            if !rates.contains(&rate) {
                rates.push(rate);
            }
        }
        if let Some(format) = from_cpal_format(range.sample_format()) {
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        u32::from(range.channels())
    };

    match device.supported_output_configs() {
        Ok(configs) => {
            info.probed = true;
            for range in configs {
                info.output_channels = info.output_channels.max(collect(range));
            }
        }
        Err(e) => debug!("'{}' has no output configs: {}", info.name, e),
    }
    match device.supported_input_configs() {
        Ok(configs) => {
            info.probed = true;
            for range in configs {
                info.input_channels = info.input_channels.max(collect(range));
            }
        }
        Err(e) => debug!("'{}' has no input configs: {}", info.name, e),
    }

    rates.sort_unstable();
    formats.sort_by_key(|format| format.resolution_rank());
    info.duplex_channels = info.output_channels.min(info.input_channels);
    info.is_default_output = info.output_channels > 0 && info.name == defaults.0;
    info.is_default_input = info.input_channels > 0 && info.name == defaults.1;
    info.preferred_sample_rate = preferred_rate(&rates);
    info.sample_rates = rates;
    info.native_formats = formats;
    info
}

/// Fixed quantum inside the hardware range, or the host default when the
/// range is unknown.
fn negotiate_buffer(
    requested: u32,
    minimize_latency: bool,
    supported: &cpal::SupportedBufferSize,
) -> (u32, cpal::BufferSize) {
    let frames = match requested {
        0 if minimize_latency => LOW_LATENCY_BUFFER_FRAMES,
        0 => DEFAULT_BUFFER_FRAMES,
        frames => frames,
    };
    match supported {
        cpal::SupportedBufferSize::Range { min, max } => {
            let frames = frames.clamp(*min, (*max).max(*min));
            (frames, cpal::BufferSize::Fixed(frames))
        }
        cpal::SupportedBufferSize::Unknown => (frames, cpal::BufferSize::Default),
    }
}

/// Duplex bridge capacity in frames
fn ring_frames(frames: u32, number_of_buffers: u32) -> usize {
    (frames as usize).saturating_mul(number_of_buffers as usize)
}

enum Command {
    Play,
    Pause,
    Close,
}

/// What the stream thread needs to build the native streams
struct StreamPlan {
    host_id: cpal::HostId,
    format: cpal::SampleFormat,
    sample_rate: u32,
    buffer_size: cpal::BufferSize,
    output: Option<StreamParameters>,
    input: Option<StreamParameters>,
    ring_frames: usize,
}

impl StreamPlan {
    fn config(&self, params: &StreamParameters) -> Result<cpal::StreamConfig> {
        let channels = u16::try_from(params.n_channels).map_err(|_| {
            OrchestraError::InvalidParameter(format!("{} channels", params.n_channels))
        })?;
        Ok(cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: self.buffer_size.clone(),
        })
    }
}

/// State the data callbacks share
#[derive(Clone)]
struct CallbackContext {
    slot: CallbackSlot,
    shared: Arc<StreamShared>,
    out_frame_bytes: usize,
    in_frame_bytes: usize,
    alert_on_xrun: bool,
    realtime: Option<Option<i32>>,
    hardware_time: bool,
}

impl CallbackContext {
    fn run(&self, output: Option<&mut [u8]>, input: Option<&[u8]>, frames: u32) {
        // Only contended while the stream is idle
        let Ok(mut slot) = self.slot.try_lock() else {
            return;
        };
        // A stop may have completed its barrier before the lock was taken
        if self.shared.state() != StreamState::Running {
            return;
        }
        let Some(callback) = slot.as_mut() else {
            return;
        };
        let status = self.shared.take_status();
        if self.alert_on_xrun && status.is_xrun() {
            warn!("stream xrun: {} (total {})", status, self.shared.xrun_count());
        }
        let result = guarded_process(
            callback.as_mut(),
            output,
            input,
            frames,
            self.shared.stream_time(),
            status,
        );
        self.shared.tick(frames);
        match result {
            None => self.shared.set_state(StreamState::Error),
            // The quantum that reported the failure was the last one
            Some(_) if status.contains(StatusKind::SystemError) => {
                self.shared.set_state(StreamState::Error)
            }
            Some(CallbackResult::Stop) | Some(CallbackResult::Abort) => {
                self.shared
                    .transition(StreamState::Running, StreamState::Stopped);
            }
            Some(CallbackResult::Continue) => {}
        }
    }

    fn on_first_quantum(&self, promoted: &mut bool) {
        if !*promoted {
            *promoted = true;
            if let Some(priority) = self.realtime {
                promote_current_thread(priority);
            }
        }
    }

    fn set_hardware_time(&self, origin: &mut Option<cpal::StreamInstant>, now: cpal::StreamInstant) {
        if !self.hardware_time {
            return;
        }
        let start = *origin.get_or_insert(now);
        if let Some(elapsed) = now.duration_since(&start) {
            self.shared.set_stream_time(elapsed.as_secs_f64());
        }
    }
}

fn output_callback(
    ctx: CallbackContext,
    mut bridge: Option<(RingConsumer, Vec<u8>)>,
) -> impl FnMut(&mut cpal::Data, &cpal::OutputCallbackInfo) + Send + 'static {
    let mut promoted = false;
    let mut origin = None;
    move |data, info| {
        let output = data.bytes_mut();
        output.fill(0);
        if ctx.shared.state() != StreamState::Running {
            return;
        }
        ctx.on_first_quantum(&mut promoted);
        ctx.set_hardware_time(&mut origin, info.timestamp().callback);

        let frames = output.len() / ctx.out_frame_bytes.max(1);
        let input = match bridge.as_mut() {
            Some((consumer, scratch)) => {
                let len = frames * ctx.in_frame_bytes;
                if scratch.len() < len {
                    scratch.resize(len, 0);
                }
                consumer.pull_or_silence(&mut scratch[..len]);
                Some(&scratch[..len])
            }
            None => None,
        };
        ctx.run(Some(output), input, frames as u32);
    }
}

fn input_callback(
    ctx: CallbackContext,
) -> impl FnMut(&cpal::Data, &cpal::InputCallbackInfo) + Send + 'static {
    let mut promoted = false;
    let mut origin = None;
    move |data, info| {
        if ctx.shared.state() != StreamState::Running {
            return;
        }
        ctx.on_first_quantum(&mut promoted);
        ctx.set_hardware_time(&mut origin, info.timestamp().callback);

        let input = data.bytes();
        let frames = input.len() / ctx.in_frame_bytes.max(1);
        ctx.run(None, Some(input), frames as u32);
    }
}

fn error_callback(
    shared: Arc<StreamShared>,
    xrun: StatusKind,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    // The next data callback delivers the status and then fails the stream
    move |err| match err {
        cpal::StreamError::DeviceNotAvailable => {
            warn!("stream device disappeared");
            shared.raise(StatusKind::SystemError);
        }
        _ => shared.raise(xrun),
    }
}

fn build_streams(plan: &StreamPlan, ctx: &CallbackContext) -> Result<Vec<cpal::Stream>> {
    let build_error =
        |e: cpal::BuildStreamError| OrchestraError::DriverError(format!("failed to build stream: {}", e));
    let mut streams = Vec::with_capacity(2);

    let bridge = match (plan.output.as_ref(), plan.input.as_ref()) {
        (Some(_), Some(params)) => {
            // Duplex: input feeds the output callback through the ring
            let device = resolve_device(plan.host_id, params.device_id)?;
            let (mut producer, consumer) =
                RingBuffer::new(plan.ring_frames, ctx.in_frame_bytes).split();
            let shared = Arc::clone(&ctx.shared);
            let stream = device
                .build_input_stream_raw(
                    &plan.config(params)?,
                    plan.format,
                    move |data: &cpal::Data, _: &cpal::InputCallbackInfo| {
                        let bytes = data.bytes();
                        if producer.push_or_drop(bytes) < bytes.len() {
                            shared.raise(StatusKind::InputOverflow);
                        }
                    },
                    error_callback(Arc::clone(&ctx.shared), StatusKind::InputOverflow),
                    None,
                )
                .map_err(build_error)?;
            streams.push(stream);
            let scratch = vec![0u8; plan.ring_frames * ctx.in_frame_bytes];
            Some((consumer, scratch))
        }
        (None, Some(params)) => {
            let device = resolve_device(plan.host_id, params.device_id)?;
            let stream = device
                .build_input_stream_raw(
                    &plan.config(params)?,
                    plan.format,
                    input_callback(ctx.clone()),
                    error_callback(Arc::clone(&ctx.shared), StatusKind::InputOverflow),
                    None,
                )
                .map_err(build_error)?;
            streams.push(stream);
            None
        }
        _ => None,
    };

    if let Some(params) = plan.output.as_ref() {
        let device = resolve_device(plan.host_id, params.device_id)?;
        let stream = device
            .build_output_stream_raw(
                &plan.config(params)?,
                plan.format,
                output_callback(ctx.clone(), bridge),
                error_callback(Arc::clone(&ctx.shared), StatusKind::OutputUnderflow),
                None,
            )
            .map_err(build_error)?;
        streams.push(stream);
    }
    Ok(streams)
}

fn run_stream_thread(
    plan: StreamPlan,
    ctx: CallbackContext,
    commands: Receiver<Command>,
    replies: Sender<Result<()>>,
) {
    let streams = match build_streams(&plan, &ctx) {
        Ok(streams) => {
            let _ = replies.send(Ok(()));
            streams
        }
        Err(e) => {
            let _ = replies.send(Err(e));
            return;
        }
    };

    let mut lost_since = None;
    loop {
        let command = match commands.recv_timeout(DEVICE_LOSS_GRACE) {
            Ok(command) => command,
            Err(RecvTimeoutError::Timeout) => {
                watch_device_loss(&ctx.shared, &mut lost_since);
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let result = match command {
            Command::Play => streams.iter().try_for_each(|stream| {
                stream
                    .play()
                    .map_err(|e| OrchestraError::DriverError(format!("failed to play: {}", e)))
            }),
            Command::Pause => streams.iter().try_for_each(|stream| {
                stream
                    .pause()
                    .map_err(|e| OrchestraError::DriverError(format!("failed to pause: {}", e)))
            }),
            Command::Close => break,
        };
        if replies.send(result).is_err() {
            break;
        }
    }
    drop(streams);
}

/// Fail the stream when a lost device's `SystemError` stays undelivered,
/// as happens once the host stops calling the data callbacks.
fn watch_device_loss(shared: &StreamShared, lost_since: &mut Option<Instant>) {
    if !shared.pending_status().contains(StatusKind::SystemError) {
        *lost_since = None;
        return;
    }
    let since = *lost_since.get_or_insert_with(Instant::now);
    if since.elapsed() >= DEVICE_LOSS_GRACE {
        match shared.state() {
            StreamState::Running | StreamState::Stopped | StreamState::Open => {
                warn!("device lost without a further callback, failing the stream");
                shared.set_state(StreamState::Error);
            }
            StreamState::Error | StreamState::Closed => {}
        }
    }
}

struct CpalStream {
    shared: Arc<StreamShared>,
    slot: CallbackSlot,
    commands: Sender<Command>,
    replies: Receiver<Result<()>>,
    worker: Option<JoinHandle<()>>,
    mode: Mode,
    buffer_frames: u32,
    number_of_buffers: u32,
}

impl CpalStream {
    fn request(&self, command: Command) -> Result<()> {
        let gone = || OrchestraError::DriverError("stream thread exited".to_string());
        self.commands.send(command).map_err(|_| gone())?;
        self.replies.recv().map_err(|_| gone())?
    }

    /// Wait for a callback in flight to return
    fn barrier(&self) {
        drop(self.slot.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn shutdown(&mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("cpal stream thread panicked");
            }
        }
    }
}

/// `Api` over one `cpal` host
pub struct CpalApi {
    host_id: cpal::HostId,
    api: ApiType,
    devices: Vec<DeviceInfo>,
    stream: Option<CpalStream>,
}

impl CpalApi {
    pub fn new(host_id: cpal::HostId, api: ApiType) -> Result<Self> {
        host(host_id)?;
        let mut backend = Self {
            host_id,
            api,
            devices: Vec::new(),
            stream: None,
        };
        backend.refresh_devices()?;
        info!(
            "{} host ready with {} device(s)",
            host_id.name(),
            backend.devices.len()
        );
        Ok(backend)
    }

    /// Re-enumerate the host's devices
    pub fn refresh_devices(&mut self) -> Result<()> {
        let host = host(self.host_id)?;
        let default_output = host
            .default_output_device()
            .and_then(|device| device.name().ok())
            .unwrap_or_default();
        let default_input = host
            .default_input_device()
            .and_then(|device| device.name().ok())
            .unwrap_or_default();
        let devices = host
            .devices()
            .map_err(|e| OrchestraError::DriverError(format!("failed to enumerate devices: {}", e)))?;
        self.devices = devices
            .enumerate()
            .map(|(index, device)| {
                probe_device(index, &device, (default_output.as_str(), default_input.as_str()))
            })
            .collect();
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut CpalStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| OrchestraError::InvalidState("no stream is open".to_string()))
    }

    fn check_direction(&self, params: &StreamParameters, mode: Mode) -> Result<()> {
        let info = self.devices.get(params.device_id).ok_or_else(|| {
            OrchestraError::InvalidParameter(format!("device index {} out of range", params.device_id))
        })?;
        if params.n_channels == 0 || params.device_channels() > info.max_channels(mode) {
            return Err(OrchestraError::InvalidParameter(format!(
                "'{}' supports {} {} channel(s)",
                info.name,
                info.max_channels(mode),
                mode
            )));
        }
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        let stream = self.stream_mut()?;
        match stream.shared.state() {
            StreamState::Open => Ok(()),
            StreamState::Running | StreamState::Stopped => {
                stream
                    .shared
                    .transition(StreamState::Running, StreamState::Stopped);
                stream.request(Command::Pause)?;
                stream.barrier();
                Ok(())
            }
            state => Err(OrchestraError::InvalidState(format!(
                "cannot stop a {} stream",
                state
            ))),
        }
    }
}

impl Api for CpalApi {
    fn api_type(&self) -> ApiType {
        self.api
    }

    fn device_count(&mut self) -> usize {
        // Idle backends follow hot-plugging; an open stream pins the indexes
        if self.stream.is_none() {
            if let Err(e) = self.refresh_devices() {
                warn!("device refresh failed: {}", e);
            }
        }
        self.devices.len()
    }

    fn device_info(&mut self, index: usize) -> Result<DeviceInfo> {
        self.devices.get(index).cloned().ok_or_else(|| {
            OrchestraError::InvalidParameter(format!(
                "device index {} out of range ({} devices)",
                index,
                self.devices.len()
            ))
        })
    }

    fn default_input_device(&mut self) -> Option<usize> {
        self.devices.iter().position(|device| device.is_default_input)
    }

    fn default_output_device(&mut self) -> Option<usize> {
        self.devices.iter().position(|device| device.is_default_output)
    }

    fn open_stream(
        &mut self,
        output: Option<&StreamParameters>,
        input: Option<&StreamParameters>,
        format: SampleFormat,
        sample_rate: u32,
        buffer_frames: &mut u32,
        options: &StreamOptions,
        mut callback: Box<dyn StreamCallback>,
    ) -> Result<()> {
        if self.stream.is_some() {
            return Err(OrchestraError::InvalidState(
                "a stream is already open".to_string(),
            ));
        }
        if options.flags.contains(Flags::EXCLUSIVE) {
            return Err(OrchestraError::unsupported("exclusive device access"));
        }
        let cpal_format = to_cpal_format(format)
            .ok_or_else(|| OrchestraError::unsupported(format!("{} samples", format)))?;
        let mode = Mode::from_directions(output.is_some(), input.is_some()).ok_or_else(|| {
            OrchestraError::InvalidParameter("no stream direction requested".to_string())
        })?;
        if let Some(params) = output {
            self.check_direction(params, Mode::Output)?;
        }
        if let Some(params) = input {
            self.check_direction(params, Mode::Input)?;
        }

        // Output drives the quantum size whenever it is present
        let (reference, is_output) = match (output, input) {
            (Some(params), _) => (params, true),
            (None, Some(params)) => (params, false),
            (None, None) => {
                return Err(OrchestraError::InvalidParameter(
                    "no stream direction requested".to_string(),
                ))
            }
        };
        let device = resolve_device(self.host_id, reference.device_id)?;
        let default_config = if is_output {
            device.default_output_config()
        } else {
            device.default_input_config()
        }
        .map_err(|e| OrchestraError::DriverError(format!("failed to query device: {}", e)))?;
        let (frames, buffer_size) = negotiate_buffer(
            options.requested_frames(*buffer_frames, sample_rate),
            options.minimize_latency(),
            default_config.buffer_size(),
        );
        let number_of_buffers = match options.number_of_buffers {
            _ if options.minimize_latency() => LOW_LATENCY_NUMBER_OF_BUFFERS,
            0 => DEFAULT_NUMBER_OF_BUFFERS,
            count => count,
        };
        if options.timestamp_mode != TimestampMode::Hardware {
            debug!("stream time derived from processed frames");
        }

        callback.prepare(frames);
        let shared = Arc::new(StreamShared::new(sample_rate));
        let slot: CallbackSlot = Arc::new(Mutex::new(Some(callback)));
        let ctx = CallbackContext {
            slot: Arc::clone(&slot),
            shared: Arc::clone(&shared),
            out_frame_bytes: output.map_or(0, |p| p.n_channels as usize * format.bytes()),
            in_frame_bytes: input.map_or(0, |p| p.n_channels as usize * format.bytes()),
            alert_on_xrun: options.flags.contains(Flags::ALERT_ON_XRUN),
            realtime: options
                .flags
                .contains(Flags::SCHEDULE_REALTIME)
                .then_some(options.priority),
            hardware_time: options.timestamp_mode == TimestampMode::Hardware,
        };
        let plan = StreamPlan {
            host_id: self.host_id,
            format: cpal_format,
            sample_rate,
            buffer_size,
            output: output.copied(),
            input: input.copied(),
            ring_frames: ring_frames(frames, number_of_buffers),
        };

        let (command_tx, command_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("orchestra-cpal".to_string())
            .spawn(move || run_stream_thread(plan, ctx, command_rx, reply_tx))
            .map_err(|e| {
                OrchestraError::ResourceExhausted(format!("failed to spawn stream thread: {}", e))
            })?;

        let mut stream = CpalStream {
            shared,
            slot,
            commands: command_tx,
            replies: reply_rx,
            worker: Some(worker),
            mode,
            buffer_frames: frames,
            number_of_buffers,
        };
        let opened = stream
            .replies
            .recv()
            .unwrap_or_else(|_| Err(OrchestraError::DriverError("stream thread exited".to_string())));
        if let Err(e) = opened {
            stream.shutdown();
            return Err(e);
        }

        debug!(
            "{}: opened {} stream, {} Hz, {} frames x {} buffers, {}",
            self.api, mode, sample_rate, frames, number_of_buffers, format
        );
        *buffer_frames = frames;
        self.stream = Some(stream);
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        let stream = self.stream_mut()?;
        match stream.shared.state() {
            StreamState::Running => Ok(()),
            StreamState::Open | StreamState::Stopped => {
                stream.shared.set_state(StreamState::Running);
                if let Err(e) = stream.request(Command::Play) {
                    stream.shared.set_state(StreamState::Error);
                    return Err(e);
                }
                Ok(())
            }
            state => Err(OrchestraError::InvalidState(format!(
                "cannot start a {} stream",
                state
            ))),
        }
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.halt()
    }

    fn abort_stream(&mut self) -> Result<()> {
        // cpal has no drain, pausing is already immediate
        self.halt()
    }

    fn close_stream(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        stream
            .shared
            .transition(StreamState::Running, StreamState::Stopped);
        stream.shutdown();
        stream.shared.set_state(StreamState::Closed);
        Ok(())
    }

    fn set_stream_callback(&mut self, mut callback: Box<dyn StreamCallback>) -> Result<()> {
        let stream = self.stream_mut()?;
        match stream.shared.state() {
            StreamState::Open | StreamState::Stopped => {
                callback.prepare(stream.buffer_frames);
                *stream.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
                Ok(())
            }
            state => Err(OrchestraError::InvalidState(format!(
                "cannot replace the callback of a {} stream",
                state
            ))),
        }
    }

    fn stream_state(&self) -> StreamState {
        self.stream
            .as_ref()
            .map(|stream| stream.shared.state())
            .unwrap_or(StreamState::Closed)
    }

    fn stream_time(&self) -> f64 {
        self.stream
            .as_ref()
            .map(|stream| stream.shared.stream_time())
            .unwrap_or(0.0)
    }

    fn stream_latency(&self) -> u64 {
        let Some(stream) = &self.stream else {
            return 0;
        };
        let frames = u64::from(stream.buffer_frames);
        let mut latency = 0;
        if stream.mode.has_output() {
            latency += frames * u64::from(stream.number_of_buffers);
        }
        if stream.mode.has_input() {
            latency += frames;
        }
        latency
    }

    fn stream_sample_rate(&self) -> u32 {
        self.stream
            .as_ref()
            .map(|stream| stream.shared.sample_rate())
            .unwrap_or(0)
    }

    fn xrun_count(&self) -> u64 {
        self.stream
            .as_ref()
            .map(|stream| stream.shared.xrun_count())
            .unwrap_or(0)
    }
}

impl Drop for CpalApi {
    fn drop(&mut self) {
        let _ = self.close_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mapping() {
        for format in SampleFormat::ALL {
            match to_cpal_format(format) {
                Some(native) => assert_eq!(from_cpal_format(native), Some(format)),
                None => assert_eq!(format, SampleFormat::Int24),
            }
        }
        assert_eq!(from_cpal_format(cpal::SampleFormat::U16), None);
    }

    #[test]
    fn test_negotiate_buffer() {
        let range = cpal::SupportedBufferSize::Range { min: 32, max: 1024 };
        assert_eq!(negotiate_buffer(0, false, &range).0, 256);
        assert_eq!(negotiate_buffer(0, true, &range).0, 64);
        assert_eq!(negotiate_buffer(4096, false, &range).0, 1024);
        assert_eq!(negotiate_buffer(8, false, &range).0, 32);
        assert!(matches!(
            negotiate_buffer(512, false, &cpal::SupportedBufferSize::Unknown),
            (512, cpal::BufferSize::Default)
        ));
    }

    #[test]
    fn test_ring_frames_do_not_overflow() {
        assert_eq!(ring_frames(256, 4), 1024);
        assert_eq!(ring_frames(u32::MAX, 4), (u32::MAX as usize).saturating_mul(4));
    }

    fn context(
        shared: &Arc<StreamShared>,
        seen: Arc<Mutex<Vec<crate::models::StreamStatus>>>,
    ) -> CallbackContext {
        let callback = crate::audio::boxed_callback(move |_, _, _, _, status| {
            seen.lock().unwrap().push(status);
            CallbackResult::Continue
        });
        CallbackContext {
            slot: Arc::new(Mutex::new(Some(callback))),
            shared: Arc::clone(shared),
            out_frame_bytes: 8,
            in_frame_bytes: 0,
            alert_on_xrun: false,
            realtime: None,
            hardware_time: false,
        }
    }

    #[test]
    fn test_device_loss_reaches_the_callback() {
        let shared = Arc::new(StreamShared::new(48000));
        shared.set_state(StreamState::Running);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ctx = context(&shared, seen.clone());

        let mut on_error = error_callback(Arc::clone(&shared), StatusKind::OutputUnderflow);
        on_error(cpal::StreamError::DeviceNotAvailable);
        assert_eq!(shared.state(), StreamState::Running);

        let mut output = vec![0u8; 64 * 8];
        ctx.run(Some(output.as_mut_slice()), None, 64);
        assert_eq!(shared.state(), StreamState::Error);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains(StatusKind::SystemError));
    }

    #[test]
    fn test_stopped_stream_skips_late_callback() {
        let shared = Arc::new(StreamShared::new(48000));
        shared.set_state(StreamState::Stopped);
        shared.raise(StatusKind::OutputUnderflow);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ctx = context(&shared, seen.clone());

        let mut output = vec![0u8; 64 * 8];
        ctx.run(Some(output.as_mut_slice()), None, 64);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(shared.frames_processed(), 0);
        // The status waits for the next running quantum
        assert!(shared.pending_status().contains(StatusKind::OutputUnderflow));
    }

    #[test]
    fn test_undelivered_device_loss_fails_stream() {
        let shared = StreamShared::new(48000);
        shared.set_state(StreamState::Running);
        let mut lost_since = None;

        watch_device_loss(&shared, &mut lost_since);
        assert!(lost_since.is_none());

        shared.raise(StatusKind::SystemError);
        watch_device_loss(&shared, &mut lost_since);
        assert!(lost_since.is_some());
        assert_eq!(shared.state(), StreamState::Running);

        lost_since = Some(Instant::now() - DEVICE_LOSS_GRACE);
        watch_device_loss(&shared, &mut lost_since);
        assert_eq!(shared.state(), StreamState::Error);
    }
}
