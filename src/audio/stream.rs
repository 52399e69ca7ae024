use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use crate::models::{AtomicStreamState, StatusKind, StreamState, StreamStatus, TimestampMode};

/// Device and channel selection for one stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamParameters {
    /// Index into the backend's device enumeration
    pub device_id: usize,
    pub n_channels: u32,
    /// First device channel used by the stream
    pub first_channel: u32,
}

impl StreamParameters {
    pub fn new(device_id: usize, n_channels: u32) -> Self {
        Self {
            device_id,
            n_channels,
            first_channel: 0,
        }
    }

    pub fn with_first_channel(mut self, first_channel: u32) -> Self {
        self.first_channel = first_channel;
        self
    }

    /// Device channels the stream occupies
    pub fn device_channels(&self) -> u32 {
        self.n_channels.saturating_add(self.first_channel)
    }
}

/// Behavioral option set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const MINIMIZE_LATENCY: Flags = Flags(0b0_0001);
    pub const EXCLUSIVE: Flags = Flags(0b0_0010);
    /// Callback buffers are planar: every channel is contiguous
    pub const NON_INTERLEAVED: Flags = Flags(0b0_0100);
    pub const SCHEDULE_REALTIME: Flags = Flags(0b0_1000);
    pub const ALERT_ON_XRUN: Flags = Flags(0b1_0000);

    const NAMES: [(Flags, &'static str); 5] = [
        (Flags::MINIMIZE_LATENCY, "minimize-latency"),
        (Flags::EXCLUSIVE, "exclusive"),
        (Flags::NON_INTERLEAVED, "non-interleaved"),
        (Flags::SCHEDULE_REALTIME, "schedule-realtime"),
        (Flags::ALERT_ON_XRUN, "alert-on-xrun"),
    ];

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    pub fn without(mut self, other: Flags) -> Flags {
        self.remove(other);
        self
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.insert(rhs);
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = Flags::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("|"))
    }
}

/// Options shaping how a backend opens the stream
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamOptions {
    /// Ring-buffer depth; zero selects the backend default
    pub number_of_buffers: u32,
    pub flags: Flags,
    /// Target latency used to size the quantum when `buffer_frames` is zero
    pub latency_hint: Option<Duration>,
    /// Requested real-time priority when `SCHEDULE_REALTIME` is set
    pub priority: Option<i32>,
    /// OS-level stream name. Backends without stream naming (dummy, cpal)
    /// ignore it.
    pub stream_name: String,
    pub timestamp_mode: TimestampMode,
}

impl StreamOptions {
    pub fn with_flags(flags: Flags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    pub fn minimize_latency(&self) -> bool {
        self.flags.contains(Flags::MINIMIZE_LATENCY)
    }

    /// Quantum size to negotiate from: an explicit `requested` wins, then
    /// `latency_hint` at `sample_rate`, then zero for the backend default.
    pub fn requested_frames(&self, requested: u32, sample_rate: u32) -> u32 {
        if requested > 0 {
            return requested;
        }
        match self.latency_hint {
            Some(hint) if !self.minimize_latency() => {
                let frames = (hint.as_secs_f64() * f64::from(sample_rate)).round();
                frames.clamp(1.0, f64::from(u32::MAX)) as u32
            }
            _ => 0,
        }
    }
}

/// State shared between the control context and the real-time context.
///
/// Everything here is a plain atomic so the audio thread never waits on
/// the control thread.
#[derive(Debug)]
pub struct StreamShared {
    state: AtomicStreamState,
    sample_rate: u32,
    frames: AtomicU64,
    time_bits: AtomicU64,
    xruns: AtomicU64,
    pending_status: AtomicU8,
}

impl StreamShared {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            state: AtomicStreamState::new(StreamState::Open),
            sample_rate,
            frames: AtomicU64::new(0),
            time_bits: AtomicU64::new(0f64.to_bits()),
            xruns: AtomicU64::new(0),
            pending_status: AtomicU8::new(0),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.load()
    }

    pub fn set_state(&self, state: StreamState) {
        self.state.store(state);
    }

    pub fn transition(&self, current: StreamState, new: StreamState) -> bool {
        self.state.transition(current, new)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Stream time in seconds of the next quantum
    pub fn stream_time(&self) -> f64 {
        f64::from_bits(self.time_bits.load(Ordering::Acquire))
    }

    /// Count a finished quantum and advance the software clock
    pub fn tick(&self, frames: u32) {
        let total = self.frames.fetch_add(u64::from(frames), Ordering::AcqRel) + u64::from(frames);
        if self.sample_rate > 0 {
            let seconds = total as f64 / f64::from(self.sample_rate);
            self.time_bits.store(seconds.to_bits(), Ordering::Release);
        }
    }

    /// Override the clock with a hardware-derived time
    pub fn set_stream_time(&self, seconds: f64) {
        self.time_bits.store(seconds.to_bits(), Ordering::Release);
    }

    /// Raise a condition for the next callback invocation
    pub fn raise(&self, kind: StatusKind) {
        let bits = StreamStatus::OK.with(kind).bits();
        self.pending_status.fetch_or(bits, Ordering::AcqRel);
        if matches!(kind, StatusKind::InputOverflow | StatusKind::OutputUnderflow) {
            self.xruns.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Drain conditions raised since the previous quantum
    pub fn take_status(&self) -> StreamStatus {
        StreamStatus::from_bits(self.pending_status.swap(0, Ordering::AcqRel))
    }

    /// Conditions raised but not yet delivered
    pub fn pending_status(&self) -> StreamStatus {
        StreamStatus::from_bits(self.pending_status.load(Ordering::Acquire))
    }

    pub fn xrun_count(&self) -> u64 {
        self.xruns.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_parameters() {
        let params = StreamParameters::new(1, 2).with_first_channel(4);
        assert_eq!(params.device_channels(), 6);
        assert_eq!(StreamParameters::new(0, 2).first_channel, 0);
    }

    #[test]
    fn test_flags_set_operations() {
        let mut flags = Flags::MINIMIZE_LATENCY | Flags::ALERT_ON_XRUN;
        assert!(flags.contains(Flags::MINIMIZE_LATENCY));
        assert!(!flags.contains(Flags::EXCLUSIVE));

        flags |= Flags::NON_INTERLEAVED;
        assert_eq!(flags.to_string(), "minimize-latency|non-interleaved|alert-on-xrun");

        let flags = flags.without(Flags::NON_INTERLEAVED | Flags::ALERT_ON_XRUN);
        assert_eq!(flags, Flags::MINIMIZE_LATENCY);
        assert_eq!(Flags::NONE.to_string(), "none");
    }

    #[test]
    fn test_stream_options_default() {
        let options = StreamOptions::default();
        assert_eq!(options.number_of_buffers, 0);
        assert!(options.flags.is_empty());
        assert_eq!(options.timestamp_mode, TimestampMode::Hardware);
        assert!(StreamOptions::with_flags(Flags::MINIMIZE_LATENCY).minimize_latency());
    }

    #[test]
    fn test_latency_hint_sizes_unset_quantum() {
        let mut options = StreamOptions::default();
        assert_eq!(options.requested_frames(0, 48000), 0);

        options.latency_hint = Some(Duration::from_millis(10));
        assert_eq!(options.requested_frames(0, 48000), 480);
        assert_eq!(options.requested_frames(0, 44100), 441);
        // An explicit size always wins
        assert_eq!(options.requested_frames(128, 48000), 128);

        options.latency_hint = Some(Duration::from_nanos(1));
        assert_eq!(options.requested_frames(0, 48000), 1);

        options.flags = Flags::MINIMIZE_LATENCY;
        assert_eq!(options.requested_frames(0, 48000), 0);
    }

    #[test]
    fn test_software_clock() {
        let shared = StreamShared::new(48000);
        assert_eq!(shared.stream_time(), 0.0);

        for _ in 0..10 {
            shared.tick(256);
        }
        assert_eq!(shared.frames_processed(), 2560);
        assert!((shared.stream_time() - 2560.0 / 48000.0).abs() < 1e-12);

        shared.set_stream_time(1.5);
        assert_eq!(shared.stream_time(), 1.5);
    }

    #[test]
    fn test_pending_status_is_drained_once() {
        let shared = StreamShared::new(44100);
        shared.raise(StatusKind::OutputUnderflow);
        shared.raise(StatusKind::OutputUnderflow);
        shared.raise(StatusKind::SystemError);

        assert!(shared.pending_status().contains(StatusKind::SystemError));
        let status = shared.take_status();
        assert!(status.contains(StatusKind::OutputUnderflow));
        assert!(status.contains(StatusKind::SystemError));
        assert!(shared.take_status().is_ok());
        assert!(shared.pending_status().is_ok());
        assert_eq!(shared.xrun_count(), 2);
    }

    #[test]
    fn test_state_transitions() {
        let shared = StreamShared::new(48000);
        assert_eq!(shared.state(), StreamState::Open);
        assert!(shared.transition(StreamState::Open, StreamState::Running));
        assert!(!shared.transition(StreamState::Open, StreamState::Running));
        shared.set_state(StreamState::Stopped);
        assert_eq!(shared.state(), StreamState::Stopped);
    }
}
