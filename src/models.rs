use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::OrchestraError;

/// Sample encodings a stream can carry. Every encoding is native endian;
/// 24-bit samples are packed in three bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    Int8,
    Int16,
    Int24,
    Int32,
    Float32,
    Float64,
}

impl SampleFormat {
    pub const ALL: [SampleFormat; 6] = [
        SampleFormat::Int8,
        SampleFormat::Int16,
        SampleFormat::Int24,
        SampleFormat::Int32,
        SampleFormat::Float32,
        SampleFormat::Float64,
    ];

    /// Width of one sample in bytes
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::Int8 => 1,
            SampleFormat::Int16 => 2,
            SampleFormat::Int24 => 3,
            SampleFormat::Int32 | SampleFormat::Float32 => 4,
            SampleFormat::Float64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    pub fn is_float(self) -> bool {
        matches!(self, SampleFormat::Float32 | SampleFormat::Float64)
    }

    /// Ordering used when a native format has to be picked for conversion:
    /// higher means more resolution is preserved.
    pub fn resolution_rank(self) -> u8 {
        match self {
            SampleFormat::Int8 => 0,
            SampleFormat::Int16 => 1,
            SampleFormat::Int24 => 2,
            SampleFormat::Int32 => 3,
            SampleFormat::Float32 => 4,
            SampleFormat::Float64 => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SampleFormat::Int8 => "s8",
            SampleFormat::Int16 => "s16",
            SampleFormat::Int24 => "s24",
            SampleFormat::Int32 => "s32",
            SampleFormat::Float32 => "f32",
            SampleFormat::Float64 => "f64",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleFormat {
    type Err = OrchestraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s8" | "i8" | "int8" => Ok(SampleFormat::Int8),
            "s16" | "i16" | "int16" => Ok(SampleFormat::Int16),
            "s24" | "i24" | "int24" => Ok(SampleFormat::Int24),
            "s32" | "i32" | "int32" => Ok(SampleFormat::Int32),
            "f32" | "float" | "float32" => Ok(SampleFormat::Float32),
            "f64" | "double" | "float64" => Ok(SampleFormat::Float64),
            other => Err(OrchestraError::InvalidParameter(format!(
                "unknown sample format '{}'",
                other
            ))),
        }
    }
}

/// Active buffer directions of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Output,
    Input,
    Duplex,
}

impl Mode {
    pub fn from_directions(has_output: bool, has_input: bool) -> Option<Mode> {
        match (has_output, has_input) {
            (true, true) => Some(Mode::Duplex),
            (true, false) => Some(Mode::Output),
            (false, true) => Some(Mode::Input),
            (false, false) => None,
        }
    }

    pub fn has_output(self) -> bool {
        matches!(self, Mode::Output | Mode::Duplex)
    }

    pub fn has_input(self) -> bool {
        matches!(self, Mode::Input | Mode::Duplex)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Output => f.write_str("output"),
            Mode::Input => f.write_str("input"),
            Mode::Duplex => f.write_str("duplex"),
        }
    }
}

/// Lifecycle state of the stream owned by an `Interface`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Closed,
    Open,
    Running,
    Stopped,
    Error,
}

impl StreamState {
    pub fn is_open(self) -> bool {
        self != StreamState::Closed
    }

    fn to_u8(self) -> u8 {
        match self {
            StreamState::Closed => 0,
            StreamState::Open => 1,
            StreamState::Running => 2,
            StreamState::Stopped => 3,
            StreamState::Error => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Open,
            2 => StreamState::Running,
            3 => StreamState::Stopped,
            4 => StreamState::Error,
            _ => StreamState::Closed,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Closed => "closed",
            StreamState::Open => "open",
            StreamState::Running => "running",
            StreamState::Stopped => "stopped",
            StreamState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Stream state shared between the control context and the real-time context
#[derive(Debug)]
pub struct AtomicStreamState(AtomicU8);

impl AtomicStreamState {
    pub fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub fn load(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: StreamState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }

    /// Move from `current` to `new`; returns false if the state was not `current`.
    pub fn transition(&self, current: StreamState, new: StreamState) -> bool {
        self.0
            .compare_exchange(current.to_u8(), new.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicStreamState {
    fn default() -> Self {
        Self::new(StreamState::Closed)
    }
}

/// Transient runtime conditions delivered into the callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    InputOverflow,
    OutputUnderflow,
    SystemError,
}

impl StatusKind {
    fn bit(self) -> u8 {
        match self {
            StatusKind::InputOverflow => 0b001,
            StatusKind::OutputUnderflow => 0b010,
            StatusKind::SystemError => 0b100,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::InputOverflow => "overflow",
            StatusKind::OutputUnderflow => "underflow",
            StatusKind::SystemError => "system-error",
        }
    }
}

/// Set of `StatusKind` raised since the previous quantum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamStatus(u8);

impl StreamStatus {
    pub const OK: StreamStatus = StreamStatus(0);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn with(mut self, kind: StatusKind) -> Self {
        self.insert(kind);
        self
    }

    pub fn insert(&mut self, kind: StatusKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(self, kind: StatusKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    pub fn is_xrun(self) -> bool {
        self.contains(StatusKind::InputOverflow) || self.contains(StatusKind::OutputUnderflow)
    }

    pub fn kinds(self) -> impl Iterator<Item = StatusKind> {
        [
            StatusKind::InputOverflow,
            StatusKind::OutputUnderflow,
            StatusKind::SystemError,
        ]
        .into_iter()
        .filter(move |kind| self.contains(*kind))
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("ok");
        }
        let names: Vec<&str> = self.kinds().map(StatusKind::as_str).collect();
        write!(f, "{}", names.join("|"))
    }
}

/// What the application callback asks the backend to do after a quantum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackResult {
    Continue,
    /// Orderly stop scheduled after the current quantum
    Stop,
    /// Immediate stop without draining
    Abort,
}

/// Capability tag identifying a backend implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiType {
    #[serde(rename = "undefined")]
    Undefined,
    #[serde(rename = "alsa")]
    Alsa,
    #[serde(rename = "pulse")]
    Pulse,
    #[serde(rename = "oss")]
    Oss,
    #[serde(rename = "jack")]
    Jack,
    #[serde(rename = "coreOSX")]
    CoreOsx,
    #[serde(rename = "coreIOS")]
    CoreIos,
    #[serde(rename = "asio")]
    Asio,
    #[serde(rename = "ds")]
    DirectSound,
    #[serde(rename = "wasapi")]
    Wasapi,
    #[serde(rename = "java")]
    Java,
    #[serde(rename = "cpal")]
    Cpal,
    #[serde(rename = "dummy")]
    Dummy,
    #[serde(rename = "user1")]
    User1,
    #[serde(rename = "user2")]
    User2,
    #[serde(rename = "user3")]
    User3,
    #[serde(rename = "user4")]
    User4,
}

impl ApiType {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiType::Undefined => "undefined",
            ApiType::Alsa => "alsa",
            ApiType::Pulse => "pulse",
            ApiType::Oss => "oss",
            ApiType::Jack => "jack",
            ApiType::CoreOsx => "coreOSX",
            ApiType::CoreIos => "coreIOS",
            ApiType::Asio => "asio",
            ApiType::DirectSound => "ds",
            ApiType::Wasapi => "wasapi",
            ApiType::Java => "java",
            ApiType::Cpal => "cpal",
            ApiType::Dummy => "dummy",
            ApiType::User1 => "user1",
            ApiType::User2 => "user2",
            ApiType::User3 => "user3",
            ApiType::User4 => "user4",
        }
    }
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiType {
    type Err = OrchestraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let api = match s.trim() {
            "undefined" => ApiType::Undefined,
            "alsa" => ApiType::Alsa,
            "pulse" => ApiType::Pulse,
            "oss" => ApiType::Oss,
            "jack" => ApiType::Jack,
            "coreOSX" => ApiType::CoreOsx,
            "coreIOS" => ApiType::CoreIos,
            "asio" => ApiType::Asio,
            "ds" => ApiType::DirectSound,
            "wasapi" => ApiType::Wasapi,
            "java" => ApiType::Java,
            "cpal" => ApiType::Cpal,
            "dummy" => ApiType::Dummy,
            "user1" => ApiType::User1,
            "user2" => ApiType::User2,
            "user3" => ApiType::User3,
            "user4" => ApiType::User4,
            other => {
                return Err(OrchestraError::InvalidParameter(format!(
                    "unknown api type '{}'",
                    other
                )))
            }
        };
        Ok(api)
    }
}

/// How a backend derives the stream time handed to the callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimestampMode {
    /// Hardware timestamp of every quantum
    #[default]
    Hardware,
    /// Hardware trigger time, then incremented by the quantum duration
    Triggered,
    /// Fully simulated from the processed frame count
    Soft,
}

impl TimestampMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TimestampMode::Hardware => "hardware",
            TimestampMode::Triggered => "trigered",
            TimestampMode::Soft => "soft",
        }
    }
}

impl FromStr for TimestampMode {
    type Err = OrchestraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "hardware" => Ok(TimestampMode::Hardware),
            "trigered" | "triggered" => Ok(TimestampMode::Triggered),
            "soft" => Ok(TimestampMode::Soft),
            other => Err(OrchestraError::InvalidParameter(format!(
                "unknown timestamp mode '{}'",
                other
            ))),
        }
    }
}
