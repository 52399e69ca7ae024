//! Software backend driven by a timer thread and a virtual clock.
//!
//! It needs no hardware, so it is the fallback of every build and the
//! backend the test suite runs against.

use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::device::{preferred_rate, DeviceInfo};
use crate::audio::registry::BackendEntry;
use crate::audio::stream::{Flags, StreamOptions, StreamParameters, StreamShared};
use crate::audio::{guarded_process, promote_current_thread, Api, StreamCallback};
use crate::error::{OrchestraError, Result};
use crate::models::{ApiType, CallbackResult, Mode, SampleFormat, StatusKind, StreamState};

pub const DUMMY_SAMPLE_RATES: [u32; 3] = [44100, 48000, 96000];
pub const DUMMY_FORMATS: [SampleFormat; 3] =
    [SampleFormat::Int16, SampleFormat::Int32, SampleFormat::Float32];

const MIN_BUFFER_FRAMES: u32 = 16;
const MAX_BUFFER_FRAMES: u32 = 8192;
const DEFAULT_BUFFER_FRAMES: u32 = 256;
const LOW_LATENCY_BUFFER_FRAMES: u32 = 64;
const DEFAULT_NUMBER_OF_BUFFERS: u32 = 4;
const LOW_LATENCY_NUMBER_OF_BUFFERS: u32 = 2;
const GRANT_POLL: Duration = Duration::from_millis(5);

/// Registry entry for the dummy backend
pub fn entry() -> BackendEntry {
    BackendEntry::new(ApiType::Dummy, create)
}

fn create() -> Result<Box<dyn Api>> {
    Ok(Box::new(DummyApi::new()))
}

/// Round a requested quantum to a power of two within the supported range
pub fn negotiate_buffer_frames(requested: u32, minimize_latency: bool) -> u32 {
    match requested {
        0 if minimize_latency => LOW_LATENCY_BUFFER_FRAMES,
        0 => DEFAULT_BUFFER_FRAMES,
        frames => frames
            .clamp(MIN_BUFFER_FRAMES, MAX_BUFFER_FRAMES)
            .next_power_of_two()
            .min(MAX_BUFFER_FRAMES),
    }
}

/// How the timer thread spaces quanta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// One quantum per quantum period of wall time
    #[default]
    RealTime,
    /// Back to back, as fast as the callback returns
    Unthrottled,
    /// Only when a [`DummyController`] grants quanta
    Stepped,
}

#[derive(Debug, Default)]
struct StepState {
    granted: u64,
    taken: u64,
    completed: u64,
    active: bool,
}

enum Grant {
    Granted,
    /// First quantum of a stream stopped before any grant
    Free,
    Stop,
}

#[derive(Debug, Default)]
struct ControlShared {
    steps: Mutex<StepState>,
    changed: Condvar,
    xrun_requested: AtomicBool,
    error_requested: AtomicBool,
}

impl ControlShared {
    fn steps(&self) -> MutexGuard<'_, StepState> {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_active(&self, active: bool) {
        let mut steps = self.steps();
        if active {
            // Grants made while idle do not carry into a run
            *steps = StepState::default();
        }
        steps.active = active;
        drop(steps);
        self.changed.notify_all();
    }

    fn wake(&self) {
        self.changed.notify_all();
    }

    fn wait_for_grant(&self, stop_requested: &AtomicBool, first: bool) -> Grant {
        let mut steps = self.steps();
        loop {
            if stop_requested.load(Ordering::Acquire) {
                return if first { Grant::Free } else { Grant::Stop };
            }
            if steps.granted > steps.taken {
                steps.taken += 1;
                return Grant::Granted;
            }
            steps = self
                .changed
                .wait_timeout(steps, GRANT_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn complete(&self, granted: bool) {
        if granted {
            self.steps().completed += 1;
        }
        self.changed.notify_all();
    }
}

/// Test handle of a [`DummyApi`]: grants quanta in `Pacing::Stepped` and
/// injects faults into the running stream.
#[derive(Debug, Clone)]
pub struct DummyController {
    shared: Arc<ControlShared>,
}

impl DummyController {
    /// Let `quanta` more quanta run and wait until they did, or until the
    /// stream stopped. Returns the quanta completed during the call.
    pub fn advance(&self, quanta: u64) -> u64 {
        let mut steps = self.shared.steps();
        let start = steps.completed;
        steps.granted += quanta;
        self.shared.changed.notify_all();
        while steps.active && steps.completed < steps.granted {
            steps = self
                .shared
                .changed
                .wait_timeout(steps, GRANT_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        steps.completed - start
    }

    /// Granted quanta completed so far
    pub fn completed(&self) -> u64 {
        self.shared.steps().completed
    }

    /// Report one xrun on the next quantum, then resynchronize
    pub fn inject_xrun(&self) {
        self.shared.xrun_requested.store(true, Ordering::Release);
    }

    /// Report `SystemError` on the next quantum and fail the stream after it
    pub fn inject_system_error(&self) {
        self.shared.error_requested.store(true, Ordering::Release);
    }
}

/// What the worker thread owns while the stream runs
struct Engine {
    callback: Box<dyn StreamCallback>,
    output: Vec<u8>,
    input: Vec<u8>,
}

struct Worker {
    shared: Arc<StreamShared>,
    control: Arc<ControlShared>,
    stop_requested: Arc<AtomicBool>,
    pacing: Pacing,
    mode: Mode,
    frames: u32,
    alert_on_xrun: bool,
    realtime: Option<Option<i32>>,
}

impl Worker {
    fn run(self, mut engine: Engine) -> Engine {
        if let Some(priority) = self.realtime {
            promote_current_thread(priority);
        }

        let period = Duration::from_secs_f64(
            f64::from(self.frames) / f64::from(self.shared.sample_rate().max(1)),
        );
        let xrun_kind = if self.mode.has_output() {
            StatusKind::OutputUnderflow
        } else {
            StatusKind::InputOverflow
        };
        let mut deadline = Instant::now() + period;
        let mut quanta: u64 = 0;

        loop {
            // A stop request is honored only after the first quantum
            let granted = match self.pacing {
                Pacing::Stepped => {
                    match self.control.wait_for_grant(&self.stop_requested, quanta == 0) {
                        Grant::Granted => true,
                        Grant::Free => false,
                        Grant::Stop => break,
                    }
                }
                Pacing::RealTime | Pacing::Unthrottled => {
                    if quanta > 0 && self.stop_requested.load(Ordering::Acquire) {
                        break;
                    }
                    false
                }
            };

            if self.control.xrun_requested.swap(false, Ordering::AcqRel) {
                self.shared.raise(xrun_kind);
                deadline = Instant::now() + period;
            }
            let fatal = self.control.error_requested.swap(false, Ordering::AcqRel);
            if fatal {
                self.shared.raise(StatusKind::SystemError);
            }

            let status = self.shared.take_status();
            if self.alert_on_xrun && status.is_xrun() {
                warn!("dummy stream xrun: {} (total {})", status, self.shared.xrun_count());
            }

            let Engine {
                callback,
                output,
                input,
            } = &mut engine;
            output.fill(0);
            let out = self.mode.has_output().then_some(output.as_mut_slice());
            let inp = self.mode.has_input().then_some(input.as_slice());
            let result = guarded_process(
                callback.as_mut(),
                out,
                inp,
                self.frames,
                self.shared.stream_time(),
                status,
            );
            self.shared.tick(self.frames);
            quanta += 1;

            // The state change lands before the quantum counts as completed
            let finished = match result {
                None => {
                    self.shared.set_state(StreamState::Error);
                    true
                }
                Some(_) if fatal => {
                    self.shared.set_state(StreamState::Error);
                    true
                }
                Some(CallbackResult::Stop) | Some(CallbackResult::Abort) => {
                    self.shared
                        .transition(StreamState::Running, StreamState::Stopped);
                    true
                }
                Some(CallbackResult::Continue) => false,
            };
            if self.pacing == Pacing::Stepped {
                self.control.complete(granted);
            }
            if finished {
                break;
            }

            if self.pacing == Pacing::RealTime {
                let now = Instant::now();
                if now > deadline + period {
                    // Late by more than a quantum: count it and resync
                    self.shared.raise(xrun_kind);
                    deadline = now + period;
                } else {
                    if deadline > now {
                        thread::sleep(deadline - now);
                    }
                    deadline += period;
                }
            }
        }

        if self.pacing == Pacing::Stepped {
            self.control.set_active(false);
        }
        engine
    }
}

struct DummyStream {
    shared: Arc<StreamShared>,
    mode: Mode,
    buffer_frames: u32,
    number_of_buffers: u32,
    flags: Flags,
    priority: Option<i32>,
    engine: Option<Engine>,
    worker: Option<JoinHandle<Engine>>,
    stop_requested: Arc<AtomicBool>,
}

impl DummyStream {
    /// Join a finished or stopping worker and take the engine back
    fn reclaim(&mut self) {
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(engine) => self.engine = Some(engine),
                Err(_) => self.shared.set_state(StreamState::Error),
            }
        }
    }
}

/// Backend with three virtual devices
pub struct DummyApi {
    devices: Vec<DeviceInfo>,
    pacing: Pacing,
    control: Arc<ControlShared>,
    stream: Option<DummyStream>,
}

impl DummyApi {
    pub fn new() -> Self {
        Self::with_pacing(Pacing::RealTime)
    }

    pub fn with_pacing(pacing: Pacing) -> Self {
        Self::with_devices(Self::default_devices(), pacing)
    }

    pub fn with_devices(devices: Vec<DeviceInfo>, pacing: Pacing) -> Self {
        Self {
            devices,
            pacing,
            control: Arc::new(ControlShared::default()),
            stream: None,
        }
    }

    pub fn controller(&self) -> DummyController {
        DummyController {
            shared: Arc::clone(&self.control),
        }
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    pub fn default_devices() -> Vec<DeviceInfo> {
        let device = |id: usize, name: &str, output: u32, input: u32, duplex: u32| DeviceInfo {
            id,
            probed: true,
            name: name.to_string(),
            output_channels: output,
            input_channels: input,
            duplex_channels: duplex,
            is_default_output: id == 0,
            is_default_input: id == 1,
            sample_rates: DUMMY_SAMPLE_RATES.to_vec(),
            preferred_sample_rate: preferred_rate(&DUMMY_SAMPLE_RATES),
            native_formats: DUMMY_FORMATS.to_vec(),
        };
        vec![
            device(0, "Dummy Output", 8, 0, 0),
            device(1, "Dummy Input", 0, 2, 0),
            device(2, "Dummy Duplex", 2, 2, 2),
        ]
    }

    fn device(&self, index: usize) -> Result<&DeviceInfo> {
        self.devices.get(index).ok_or_else(|| {
            OrchestraError::InvalidParameter(format!(
                "device index {} out of range ({} devices)",
                index,
                self.devices.len()
            ))
        })
    }

    fn check_direction(&self, params: &StreamParameters, mode: Mode, sample_rate: u32) -> Result<()> {
        let info = self.device(params.device_id)?;
        if params.n_channels == 0 {
            return Err(OrchestraError::InvalidParameter(
                "channel count must be at least 1".to_string(),
            ));
        }
        if params.device_channels() > info.max_channels(mode) {
            return Err(OrchestraError::InvalidParameter(format!(
                "'{}' supports {} {} channel(s), {} requested",
                info.name,
                info.max_channels(mode),
                mode,
                params.device_channels()
            )));
        }
        if !info.supports_sample_rate(sample_rate) {
            return Err(OrchestraError::InvalidParameter(format!(
                "'{}' does not support {} Hz",
                info.name, sample_rate
            )));
        }
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut DummyStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| OrchestraError::InvalidState("no stream is open".to_string()))
    }

    fn halt(&mut self) -> Result<()> {
        let control = Arc::clone(&self.control);
        let stream = self.stream_mut()?;
        match stream.shared.state() {
            StreamState::Closed => Err(OrchestraError::InvalidState("no stream is open".to_string())),
            StreamState::Error => Err(OrchestraError::InvalidState(
                "stream is in error state".to_string(),
            )),
            StreamState::Open => Ok(()),
            StreamState::Stopped => {
                stream.reclaim();
                Ok(())
            }
            StreamState::Running => {
                stream.stop_requested.store(true, Ordering::Release);
                control.wake();
                stream.reclaim();
                stream
                    .shared
                    .transition(StreamState::Running, StreamState::Stopped);
                Ok(())
            }
        }
    }
}

impl Default for DummyApi {
    fn default() -> Self {
        Self::new()
    }
}

impl Api for DummyApi {
    fn api_type(&self) -> ApiType {
        ApiType::Dummy
    }

    fn device_count(&mut self) -> usize {
        self.devices.len()
    }

    fn device_info(&mut self, index: usize) -> Result<DeviceInfo> {
        self.device(index).cloned()
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
        let mode = Mode::from_directions(output.is_some(), input.is_some()).ok_or_else(|| {
            OrchestraError::InvalidParameter("no stream direction requested".to_string())
        })?;

        let mut output_channels = 0;
        let mut input_channels = 0;
        if let Some(params) = output {
            self.check_direction(params, Mode::Output, sample_rate)?;
            output_channels = params.device_channels() as usize;
        }
        if let Some(params) = input {
            self.check_direction(params, Mode::Input, sample_rate)?;
            input_channels = params.device_channels() as usize;
        }
        if let (Some(out), Some(inp)) = (output, input) {
            if out.device_id == inp.device_id {
                let limit = self.device(out.device_id)?.duplex_channels;
                if out.device_channels().max(inp.device_channels()) > limit {
                    return Err(OrchestraError::InvalidParameter(format!(
                        "duplex streams on this device are limited to {} channel(s)",
                        limit
                    )));
                }
            }
        }
        if !DUMMY_FORMATS.contains(&format) {
            return Err(OrchestraError::InvalidParameter(format!(
                "{} is not a native format of the dummy backend",
                format
            )));
        }

        let minimize_latency = options.minimize_latency();
        let frames = negotiate_buffer_frames(
            options.requested_frames(*buffer_frames, sample_rate),
            minimize_latency,
        );
        let number_of_buffers = match options.number_of_buffers {
            _ if minimize_latency => LOW_LATENCY_NUMBER_OF_BUFFERS,
            0 => DEFAULT_NUMBER_OF_BUFFERS,
            count => count,
        };

        callback.prepare(frames);
        let engine = Engine {
            callback,
            output: vec![0u8; frames as usize * output_channels * format.bytes()],
            input: vec![0u8; frames as usize * input_channels * format.bytes()],
        };

        debug!(
            "dummy: opened {} stream, {} Hz, {} frames x {} buffers, {}",
            mode, sample_rate, frames, number_of_buffers, format
        );
        *buffer_frames = frames;
        self.stream = Some(DummyStream {
            shared: Arc::new(StreamShared::new(sample_rate)),
            mode,
            buffer_frames: frames,
            number_of_buffers,
            flags: options.flags,
            priority: options.priority,
            engine: Some(engine),
            worker: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
        });
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        let pacing = self.pacing;
        let control = Arc::clone(&self.control);
        let stream = self.stream_mut()?;
        match stream.shared.state() {
            StreamState::Running => return Ok(()),
            StreamState::Error => {
                return Err(OrchestraError::InvalidState(
                    "stream is in error state".to_string(),
                ))
            }
            StreamState::Closed => {
                return Err(OrchestraError::InvalidState("no stream is open".to_string()))
            }
            StreamState::Open | StreamState::Stopped => {}
        }

        stream.reclaim();
        let engine = stream.engine.take().ok_or_else(|| {
            OrchestraError::InvalidState("stream callback is unavailable".to_string())
        })?;

        let worker = Worker {
            shared: Arc::clone(&stream.shared),
            control: Arc::clone(&control),
            stop_requested: Arc::clone(&stream.stop_requested),
            pacing,
            mode: stream.mode,
            frames: stream.buffer_frames,
            alert_on_xrun: stream.flags.contains(Flags::ALERT_ON_XRUN),
            realtime: stream
                .flags
                .contains(Flags::SCHEDULE_REALTIME)
                .then_some(stream.priority),
        };

        stream.stop_requested.store(false, Ordering::Release);
        stream.shared.set_state(StreamState::Running);
        if pacing == Pacing::Stepped {
            control.set_active(true);
        }

        let handle = thread::Builder::new()
            .name("orchestra-dummy".to_string())
            .spawn(move || worker.run(engine))
            .map_err(|e| {
                stream.shared.set_state(StreamState::Error);
                control.set_active(false);
                OrchestraError::ResourceExhausted(format!("failed to spawn dummy thread: {}", e))
            })?;
        stream.worker = Some(handle);
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.halt()
    }

    fn abort_stream(&mut self) -> Result<()> {
        // Nothing is queued behind the quantum in flight
        self.halt()
    }

    fn close_stream(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        stream.stop_requested.store(true, Ordering::Release);
        self.control.wake();
        stream.reclaim();
        stream.shared.set_state(StreamState::Closed);
        debug!(
            "dummy: closed stream after {} frames",
            stream.shared.frames_processed()
        );
        Ok(())
    }

    fn set_stream_callback(&mut self, mut callback: Box<dyn StreamCallback>) -> Result<()> {
        let stream = self.stream_mut()?;
        match stream.shared.state() {
            StreamState::Open | StreamState::Stopped => {}
            state => {
                return Err(OrchestraError::InvalidState(format!(
                    "cannot replace the callback of a {} stream",
                    state
                )))
            }
        }
        stream.reclaim();
        let engine = stream.engine.as_mut().ok_or_else(|| {
            OrchestraError::InvalidState("stream callback is unavailable".to_string())
        })?;
        callback.prepare(stream.buffer_frames);
        engine.callback = callback;
        Ok(())
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

impl Drop for DummyApi {
    fn drop(&mut self) {
        let _ = self.close_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::boxed_callback;
    use crate::models::StreamStatus;
    use std::sync::atomic::AtomicU32;

    fn counting_callback(count: Arc<AtomicU32>, stop_after: u32) -> Box<dyn StreamCallback> {
        boxed_callback(move |_, _, _, _, _| {
            let calls = count.fetch_add(1, Ordering::SeqCst) + 1;
            if stop_after > 0 && calls >= stop_after {
                CallbackResult::Stop
            } else {
                CallbackResult::Continue
            }
        })
    }

    fn open_output(api: &mut DummyApi, callback: Box<dyn StreamCallback>) -> u32 {
        let mut frames = 256;
        api.open_stream(
            Some(&StreamParameters::new(0, 2)),
            None,
            SampleFormat::Float32,
            48000,
            &mut frames,
            &StreamOptions::default(),
            callback,
        )
        .unwrap();
        frames
    }

    #[test]
    fn test_negotiate_buffer_frames() {
        assert_eq!(negotiate_buffer_frames(0, false), 256);
        assert_eq!(negotiate_buffer_frames(0, true), 64);
        assert_eq!(negotiate_buffer_frames(256, false), 256);
        assert_eq!(negotiate_buffer_frames(300, false), 512);
        assert_eq!(negotiate_buffer_frames(1, false), 16);
        assert_eq!(negotiate_buffer_frames(100_000, false), 8192);
    }

    #[test]
    fn test_default_devices() {
        let mut api = DummyApi::new();
        assert_eq!(api.device_count(), 3);
        assert_eq!(api.default_output_device(), Some(0));
        assert_eq!(api.default_input_device(), Some(1));

        let duplex = api.device_info(2).unwrap();
        assert_eq!(duplex.name, "Dummy Duplex");
        assert_eq!(duplex.duplex_channels, 2);
        assert_eq!(duplex.preferred_sample_rate, 48000);
        assert!(api.device_info(3).is_err());
        assert_eq!(api.probe_devices().unwrap().len(), 3);
    }

    #[test]
    fn test_open_rejects_invalid_requests() {
        let mut api = DummyApi::new();
        let mut frames = 256;
        let callback = || boxed_callback(|_, _, _, _, _| CallbackResult::Continue);

        let err = api
            .open_stream(
                Some(&StreamParameters::new(1, 2)),
                None,
                SampleFormat::Float32,
                48000,
                &mut frames,
                &StreamOptions::default(),
                callback(),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestraError::InvalidParameter(_)));

        let err = api
            .open_stream(
                Some(&StreamParameters::new(0, 2)),
                None,
                SampleFormat::Int24,
                48000,
                &mut frames,
                &StreamOptions::default(),
                callback(),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestraError::InvalidParameter(_)));
        assert_eq!(api.stream_state(), StreamState::Closed);
    }

    #[test]
    fn test_stepped_pacing_runs_granted_quanta() {
        let mut api = DummyApi::with_pacing(Pacing::Stepped);
        let controller = api.controller();
        let count = Arc::new(AtomicU32::new(0));
        open_output(&mut api, counting_callback(count.clone(), 0));

        api.start_stream().unwrap();
        assert_eq!(controller.advance(5), 5);
        assert_eq!(count.load(Ordering::SeqCst), 5);

        api.stop_stream().unwrap();
        assert_eq!(api.stream_state(), StreamState::Stopped);
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert!((api.stream_time() - 5.0 * 256.0 / 48000.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_quantum_runs_even_if_stopped_immediately() {
        let mut api = DummyApi::with_pacing(Pacing::Stepped);
        let count = Arc::new(AtomicU32::new(0));
        open_output(&mut api, counting_callback(count.clone(), 0));

        api.start_stream().unwrap();
        api.stop_stream().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_stop_ends_stream() {
        let mut api = DummyApi::with_pacing(Pacing::Unthrottled);
        let count = Arc::new(AtomicU32::new(0));
        open_output(&mut api, counting_callback(count.clone(), 3));

        api.start_stream().unwrap();
        while api.stream_state() == StreamState::Running {
            thread::yield_now();
        }
        assert_eq!(api.stream_state(), StreamState::Stopped);
        api.stop_stream().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // Restart reuses the reclaimed callback
        api.start_stream().unwrap();
        while api.stream_state() == StreamState::Running {
            thread::yield_now();
        }
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_panicking_callback_moves_stream_to_error() {
        let mut api = DummyApi::with_pacing(Pacing::Unthrottled);
        open_output(
            &mut api,
            boxed_callback(|_, _, _, _, _| panic!("callback failure")),
        );

        api.start_stream().unwrap();
        while api.stream_state() == StreamState::Running {
            thread::yield_now();
        }
        assert_eq!(api.stream_state(), StreamState::Error);
        assert!(matches!(api.start_stream(), Err(OrchestraError::InvalidState(_))));
        api.close_stream().unwrap();
        assert_eq!(api.stream_state(), StreamState::Closed);
    }

    #[test]
    fn test_injected_xrun_is_reported_once() {
        let mut api = DummyApi::with_pacing(Pacing::Stepped);
        let controller = api.controller();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        open_output(
            &mut api,
            boxed_callback(move |_, _, _, _, status: StreamStatus| {
                sink.lock().unwrap().push(status);
                CallbackResult::Continue
            }),
        );

        api.start_stream().unwrap();
        controller.advance(1);
        controller.inject_xrun();
        controller.advance(2);
        api.stop_stream().unwrap();

        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.len(), 3);
        assert!(statuses[0].is_ok());
        assert!(statuses[1].contains(StatusKind::OutputUnderflow));
        assert!(statuses[2].is_ok());
        assert_eq!(api.xrun_count(), 1);
    }

    #[test]
    fn test_injected_system_error_fails_stream() {
        let mut api = DummyApi::with_pacing(Pacing::Stepped);
        let controller = api.controller();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        open_output(
            &mut api,
            boxed_callback(move |_, _, _, _, status| {
                sink.lock().unwrap().push(status);
                CallbackResult::Continue
            }),
        );

        api.start_stream().unwrap();
        controller.inject_system_error();
        controller.advance(3);

        assert_eq!(api.stream_state(), StreamState::Error);
        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].contains(StatusKind::SystemError));
    }

    #[test]
    fn test_input_delivers_silence() {
        let mut api = DummyApi::with_pacing(Pacing::Stepped);
        let controller = api.controller();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut frames = 64;
        api.open_stream(
            None,
            Some(&StreamParameters::new(1, 2)),
            SampleFormat::Int16,
            44100,
            &mut frames,
            &StreamOptions::default(),
            boxed_callback(move |out, input, _, _, _| {
                assert!(out.is_none());
                if let Some(input) = input {
                    sink.lock().unwrap().push((input.len(), input.iter().all(|b| *b == 0)));
                }
                CallbackResult::Continue
            }),
        )
        .unwrap();

        api.start_stream().unwrap();
        controller.advance(2);
        api.close_stream().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(64 * 2 * 2, true); 2]);
    }

    #[test]
    fn test_set_stream_callback_requires_idle_stream() {
        let mut api = DummyApi::with_pacing(Pacing::Stepped);
        let controller = api.controller();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        open_output(&mut api, counting_callback(first.clone(), 0));

        api.start_stream().unwrap();
        let err = api
            .set_stream_callback(counting_callback(second.clone(), 0))
            .unwrap_err();
        assert!(matches!(err, OrchestraError::InvalidState(_)));
        controller.advance(1);
        api.stop_stream().unwrap();

        api.set_stream_callback(counting_callback(second.clone(), 0)).unwrap();
        api.start_stream().unwrap();
        controller.advance(2);
        api.stop_stream().unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_latency_hint_picks_buffer_size() {
        let mut api = DummyApi::new();
        let options = StreamOptions {
            latency_hint: Some(Duration::from_millis(10)),
            ..StreamOptions::default()
        };
        let mut frames = 0;
        api.open_stream(
            Some(&StreamParameters::new(0, 2)),
            None,
            SampleFormat::Float32,
            48000,
            &mut frames,
            &options,
            boxed_callback(|_, _, _, _, _| CallbackResult::Continue),
        )
        .unwrap();
        // 480 frames rounded up to a power of two
        assert_eq!(frames, 512);
        api.close_stream().unwrap();

        let mut frames = 128;
        api.open_stream(
            Some(&StreamParameters::new(0, 2)),
            None,
            SampleFormat::Float32,
            48000,
            &mut frames,
            &options,
            boxed_callback(|_, _, _, _, _| CallbackResult::Continue),
        )
        .unwrap();
        assert_eq!(frames, 128);
    }

    #[test]
    fn test_state_changes_before_advance_returns() {
        let mut api = DummyApi::with_pacing(Pacing::Stepped);
        let controller = api.controller();
        open_output(&mut api, boxed_callback(|_, _, _, _, _| CallbackResult::Continue));
        for _ in 0..50 {
            api.start_stream().unwrap();
            controller.inject_system_error();
            assert_eq!(controller.advance(1), 1);
            assert_eq!(api.stream_state(), StreamState::Error);
            api.close_stream().unwrap();
            open_output(&mut api, boxed_callback(|_, _, _, _, _| CallbackResult::Continue));
        }

        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            api.close_stream().unwrap();
            open_output(&mut api, counting_callback(calls.clone(), 1));
            api.start_stream().unwrap();
            assert_eq!(controller.advance(1), 1);
            assert_eq!(api.stream_state(), StreamState::Stopped);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_panic_reported_before_advance_returns() {
        let mut api = DummyApi::with_pacing(Pacing::Stepped);
        let controller = api.controller();
        for _ in 0..50 {
            open_output(
                &mut api,
                boxed_callback(|_, _, _, _, _| panic!("callback failure")),
            );
            api.start_stream().unwrap();
            assert_eq!(controller.advance(1), 1);
            assert_eq!(api.stream_state(), StreamState::Error);
            api.close_stream().unwrap();
        }
    }

    #[test]
    fn test_grants_before_start_are_discarded() {
        let mut api = DummyApi::with_pacing(Pacing::Stepped);
        let controller = api.controller();
        let count = Arc::new(AtomicU32::new(0));
        open_output(&mut api, counting_callback(count.clone(), 0));

        assert_eq!(controller.advance(5), 0);
        api.start_stream().unwrap();
        assert_eq!(controller.advance(2), 2);
        api.stop_stream().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(controller.completed(), 2);
    }

    #[test]
    fn test_latency_and_rate() {
        let mut api = DummyApi::new();
        let frames = open_output(&mut api, boxed_callback(|_, _, _, _, _| CallbackResult::Continue));
        assert_eq!(frames, 256);
        assert_eq!(api.stream_latency(), 256 * 4);
        assert_eq!(api.stream_sample_rate(), 48000);
        api.close_stream().unwrap();
        assert_eq!(api.stream_latency(), 0);
    }
}
