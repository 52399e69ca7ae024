//! Sample-format and layout conversion between callback buffers and the
//! buffers a backend exchanges with the device.
//!
//! Integers travel through a left-justified `i32`, floats through `f64`.
//! Integer widening is exact; float to integer rounds and saturates at the
//! representable range edges.

use crate::audio::stream::StreamParameters;
use crate::audio::StreamCallback;
use crate::models::{CallbackResult, SampleFormat, StreamStatus};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Sample {
    Int(i32),
    Float(f64),
}

fn decode(format: SampleFormat, bytes: &[u8]) -> Sample {
    match format {
        SampleFormat::Int8 => Sample::Int(i32::from(bytes[0] as i8) << 24),
        SampleFormat::Int16 => Sample::Int(i32::from(i16::from_ne_bytes([bytes[0], bytes[1]])) << 16),
        SampleFormat::Int24 => {
            let word = if cfg!(target_endian = "little") {
                [0, bytes[0], bytes[1], bytes[2]]
            } else {
                [bytes[0], bytes[1], bytes[2], 0]
            };
            Sample::Int(i32::from_ne_bytes(word))
        }
        SampleFormat::Int32 => {
            Sample::Int(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        SampleFormat::Float32 => Sample::Float(f64::from(f32::from_ne_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        SampleFormat::Float64 => {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[..8]);
            Sample::Float(f64::from_ne_bytes(word))
        }
    }
}

fn float_to_int(value: f64, bits: u32) -> i64 {
    let scale = (1i64 << (bits - 1)) as f64;
    let scaled = (value * scale).round();
    scaled.clamp(-scale, scale - 1.0) as i64
}

fn encode(format: SampleFormat, sample: Sample, out: &mut [u8]) {
    match format {
        SampleFormat::Float32 => {
            let value = match sample {
                Sample::Int(v) => f64::from(v) / 2f64.powi(31),
                Sample::Float(v) => v,
            };
            out[..4].copy_from_slice(&(value as f32).to_ne_bytes());
        }
        SampleFormat::Float64 => {
            let value = match sample {
                Sample::Int(v) => f64::from(v) / 2f64.powi(31),
                Sample::Float(v) => v,
            };
            out[..8].copy_from_slice(&value.to_ne_bytes());
        }
        SampleFormat::Int8 => {
            let value = match sample {
                Sample::Int(v) => (v >> 24) as i8,
                Sample::Float(v) => float_to_int(v, 8) as i8,
            };
            out[0] = value as u8;
        }
        SampleFormat::Int16 => {
            let value = match sample {
                Sample::Int(v) => (v >> 16) as i16,
                Sample::Float(v) => float_to_int(v, 16) as i16,
            };
            out[..2].copy_from_slice(&value.to_ne_bytes());
        }
        SampleFormat::Int24 => {
            let word = match sample {
                Sample::Int(v) => v & !0xff,
                Sample::Float(v) => (float_to_int(v, 24) as i32) << 8,
            };
            let bytes = word.to_ne_bytes();
            if cfg!(target_endian = "little") {
                out[..3].copy_from_slice(&bytes[1..4]);
            } else {
                out[..3].copy_from_slice(&bytes[0..3]);
            }
        }
        SampleFormat::Int32 => {
            let value = match sample {
                Sample::Int(v) => v,
                Sample::Float(v) => float_to_int(v, 32) as i32,
            };
            out[..4].copy_from_slice(&value.to_ne_bytes());
        }
    }
}

/// Convert one sample between encodings
pub fn convert_sample(from: SampleFormat, src: &[u8], to: SampleFormat, dst: &mut [u8]) {
    if from == to {
        let width = from.bytes();
        dst[..width].copy_from_slice(&src[..width]);
        return;
    }
    encode(to, decode(from, src), dst);
}

/// Convert a run of interleaved samples; the sample count is limited by the
/// shorter of the two buffers.
pub fn convert_samples(from: SampleFormat, src: &[u8], to: SampleFormat, dst: &mut [u8]) -> usize {
    let count = (src.len() / from.bytes()).min(dst.len() / to.bytes());
    for (s, d) in src
        .chunks_exact(from.bytes())
        .zip(dst.chunks_exact_mut(to.bytes()))
        .take(count)
    {
        convert_sample(from, s, to, d);
    }
    count
}

/// How one stream direction maps between the callback buffer and the
/// device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionPlan {
    pub user_format: SampleFormat,
    pub device_format: SampleFormat,
    pub user_channels: usize,
    pub device_channels: usize,
    pub first_channel: usize,
    pub user_interleaved: bool,
}

impl ConversionPlan {
    pub fn new(
        user_format: SampleFormat,
        device_format: SampleFormat,
        params: &StreamParameters,
        user_interleaved: bool,
    ) -> Self {
        Self {
            user_format,
            device_format,
            user_channels: params.n_channels as usize,
            device_channels: params.device_channels() as usize,
            first_channel: params.first_channel as usize,
            user_interleaved,
        }
    }

    /// True when the callback can work on the device buffer directly
    pub fn is_identity(&self) -> bool {
        self.user_format == self.device_format
            && self.first_channel == 0
            && self.device_channels == self.user_channels
            && (self.user_interleaved || self.user_channels == 1)
    }

    pub fn user_bytes(&self, frames: usize) -> usize {
        frames * self.user_channels * self.user_format.bytes()
    }

    pub fn device_bytes(&self, frames: usize) -> usize {
        frames * self.device_channels * self.device_format.bytes()
    }

    fn user_index(&self, frame: usize, channel: usize, frames: usize) -> usize {
        if self.user_interleaved {
            frame * self.user_channels + channel
        } else {
            channel * frames + frame
        }
    }

    fn device_index(&self, frame: usize, channel: usize) -> usize {
        frame * self.device_channels + self.first_channel + channel
    }

    fn clamp_frames(&self, user_len: usize, device_len: usize, frames: usize) -> usize {
        let user_frame = (self.user_channels * self.user_format.bytes()).max(1);
        let device_frame = (self.device_channels * self.device_format.bytes()).max(1);
        frames.min(user_len / user_frame).min(device_len / device_frame)
    }

    /// Output direction. Device channels outside the stream are silenced.
    pub fn user_to_device(&self, user: &[u8], device: &mut [u8], frames: usize) {
        device.fill(0);
        let frames = self.clamp_frames(user.len(), device.len(), frames);
        let (uw, dw) = (self.user_format.bytes(), self.device_format.bytes());
        for frame in 0..frames {
            for channel in 0..self.user_channels {
                let u = self.user_index(frame, channel, frames) * uw;
                let d = self.device_index(frame, channel) * dw;
                convert_sample(
                    self.user_format,
                    &user[u..u + uw],
                    self.device_format,
                    &mut device[d..d + dw],
                );
            }
        }
    }

    /// Input direction
    pub fn device_to_user(&self, device: &[u8], user: &mut [u8], frames: usize) {
        let frames = self.clamp_frames(user.len(), device.len(), frames);
        let (uw, dw) = (self.user_format.bytes(), self.device_format.bytes());
        for frame in 0..frames {
            for channel in 0..self.user_channels {
                let u = self.user_index(frame, channel, frames) * uw;
                let d = self.device_index(frame, channel) * dw;
                convert_sample(
                    self.device_format,
                    &device[d..d + dw],
                    self.user_format,
                    &mut user[u..u + uw],
                );
            }
        }
    }
}

/// Callback wrapper that presents the application's format and layout
/// while the backend runs the device's native one.
///
/// Scratch buffers are sized in `prepare`, so `process` does not allocate.
pub struct FormatAdapter {
    inner: Box<dyn StreamCallback>,
    output: Option<ConversionPlan>,
    input: Option<ConversionPlan>,
    user_output: Vec<u8>,
    user_input: Vec<u8>,
}

impl FormatAdapter {
    pub fn new(
        inner: Box<dyn StreamCallback>,
        output: Option<ConversionPlan>,
        input: Option<ConversionPlan>,
    ) -> Self {
        Self {
            inner,
            output: output.filter(|plan| !plan.is_identity()),
            input: input.filter(|plan| !plan.is_identity()),
            user_output: Vec::new(),
            user_input: Vec::new(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.output.is_none() && self.input.is_none()
    }

    /// Hand back the application callback
    pub fn into_inner(self) -> Box<dyn StreamCallback> {
        self.inner
    }
}

fn reserve(buffer: &mut Vec<u8>, len: usize) {
    // Only grows when a backend delivers a larger quantum than negotiated
    if buffer.len() < len {
        buffer.resize(len, 0);
    }
}

impl StreamCallback for FormatAdapter {
    fn prepare(&mut self, buffer_frames: u32) {
        let frames = buffer_frames as usize;
        if let Some(plan) = self.output {
            reserve(&mut self.user_output, plan.user_bytes(frames));
        }
        if let Some(plan) = self.input {
            reserve(&mut self.user_input, plan.user_bytes(frames));
        }
        self.inner.prepare(buffer_frames);
    }

    fn process(
        &mut self,
        output: Option<&mut [u8]>,
        input: Option<&[u8]>,
        frames: u32,
        stream_time: f64,
        status: StreamStatus,
    ) -> CallbackResult {
        let n = frames as usize;

        let user_input = match (input, self.input) {
            (Some(device), Some(plan)) => {
                let len = plan.user_bytes(n);
                reserve(&mut self.user_input, len);
                plan.device_to_user(device, &mut self.user_input[..len], n);
                Some(&self.user_input[..len])
            }
            (device, _) => device,
        };

        match (output, self.output) {
            (Some(device), Some(plan)) => {
                let len = plan.user_bytes(n);
                reserve(&mut self.user_output, len);
                let user = &mut self.user_output[..len];
                user.fill(0);
                let result = self
                    .inner
                    .process(Some(user), user_input, frames, stream_time, status);
                plan.user_to_device(&self.user_output[..len], device, n);
                result
            }
            (device, _) => self
                .inner
                .process(device, user_input, frames, stream_time, status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn f32_values(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn i16_values(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_float_to_int16_round_trip_within_one_lsb() {
        let original: Vec<f32> = (0..1000).map(|i| ((i as f32) * 0.0137).sin() * 0.999).collect();
        let mut extremes = vec![-1.0f32, 1.0, 0.0, 0.5, -0.5];
        let mut input = original.clone();
        input.append(&mut extremes);

        let encoded = f32_bytes(&input);
        let mut as_i16 = vec![0u8; input.len() * 2];
        let mut back = vec![0u8; input.len() * 4];
        convert_samples(SampleFormat::Float32, &encoded, SampleFormat::Int16, &mut as_i16);
        convert_samples(SampleFormat::Int16, &as_i16, SampleFormat::Float32, &mut back);

        let lsb = 1.0 / 32768.0;
        for (a, b) in input.iter().zip(f32_values(&back)) {
            assert!((a - b).abs() <= lsb, "{} -> {}", a, b);
        }
    }

    #[test]
    fn test_float_to_int_saturates() {
        let encoded = f32_bytes(&[2.0, -2.0, 1.0, -1.0]);
        let mut out = vec![0u8; 8];
        convert_samples(SampleFormat::Float32, &encoded, SampleFormat::Int16, &mut out);
        assert_eq!(i16_values(&out), vec![i16::MAX, i16::MIN, i16::MAX, i16::MIN]);

        let mut out = [0u8; 1];
        convert_sample(SampleFormat::Float64, &0.5f64.to_ne_bytes(), SampleFormat::Int8, &mut out);
        assert_eq!(out[0] as i8, 64);
    }

    #[test]
    fn test_integer_widening_is_lossless() {
        let values: Vec<i16> = vec![i16::MIN, -12345, -1, 0, 1, 12345, i16::MAX];
        let encoded: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();

        for wide in [SampleFormat::Int24, SampleFormat::Int32, SampleFormat::Float32, SampleFormat::Float64] {
            let mut widened = vec![0u8; values.len() * wide.bytes()];
            let mut back = vec![0u8; encoded.len()];
            convert_samples(SampleFormat::Int16, &encoded, wide, &mut widened);
            convert_samples(wide, &widened, SampleFormat::Int16, &mut back);
            assert_eq!(i16_values(&back), values, "via {}", wide);
        }
    }

    #[test]
    fn test_int24_is_packed_native_endian() {
        let mut packed = [0u8; 3];
        convert_sample(
            SampleFormat::Int32,
            &0x1234_5600i32.to_ne_bytes(),
            SampleFormat::Int24,
            &mut packed,
        );
        let expected = if cfg!(target_endian = "little") {
            [0x56, 0x34, 0x12]
        } else {
            [0x12, 0x34, 0x56]
        };
        assert_eq!(packed, expected);

        let mut word = [0u8; 4];
        convert_sample(SampleFormat::Int24, &packed, SampleFormat::Int32, &mut word);
        assert_eq!(i32::from_ne_bytes(word), 0x1234_5600);
    }

    #[test]
    fn test_negative_int24_sign_extends() {
        let mut packed = [0u8; 3];
        convert_sample(SampleFormat::Int16, &(-2i16).to_ne_bytes(), SampleFormat::Int24, &mut packed);
        let mut back = [0u8; 2];
        convert_sample(SampleFormat::Int24, &packed, SampleFormat::Int16, &mut back);
        assert_eq!(i16::from_ne_bytes(back), -2);
    }

    #[test]
    fn test_plan_identity() {
        let params = StreamParameters::new(0, 2);
        assert!(ConversionPlan::new(SampleFormat::Int16, SampleFormat::Int16, &params, true).is_identity());
        assert!(!ConversionPlan::new(SampleFormat::Int16, SampleFormat::Int16, &params, false).is_identity());
        let offset = StreamParameters::new(0, 2).with_first_channel(1);
        assert!(!ConversionPlan::new(SampleFormat::Int16, SampleFormat::Int16, &offset, true).is_identity());
    }

    #[test]
    fn test_first_channel_offset_and_silence() {
        // 2 stream channels placed on device channels 2 and 3 of 4
        let params = StreamParameters::new(0, 2).with_first_channel(2);
        let plan = ConversionPlan::new(SampleFormat::Int16, SampleFormat::Int16, &params, true);
        assert_eq!(plan.device_channels, 4);

        let user: Vec<u8> = [1i16, 2, 3, 4].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut device = vec![0xffu8; plan.device_bytes(2)];
        plan.user_to_device(&user, &mut device, 2);
        assert_eq!(i16_values(&device), vec![0, 0, 1, 2, 0, 0, 3, 4]);

        let mut captured = vec![0u8; plan.user_bytes(2)];
        plan.device_to_user(&device, &mut captured, 2);
        assert_eq!(i16_values(&captured), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_non_interleaved_layout() {
        let params = StreamParameters::new(0, 2);
        let plan = ConversionPlan::new(SampleFormat::Int16, SampleFormat::Int16, &params, false);

        // planar: L0 L1 L2 R0 R1 R2
        let planar: Vec<u8> = [10i16, 11, 12, 20, 21, 22].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut device = vec![0u8; plan.device_bytes(3)];
        plan.user_to_device(&planar, &mut device, 3);
        assert_eq!(i16_values(&device), vec![10, 20, 11, 21, 12, 22]);

        let mut back = vec![0u8; plan.user_bytes(3)];
        plan.device_to_user(&device, &mut back, 3);
        assert_eq!(back, planar);
    }

    #[test]
    fn test_format_adapter_converts_output() {
        let params = StreamParameters::new(0, 1);
        let plan = ConversionPlan::new(SampleFormat::Float32, SampleFormat::Int16, &params, true);
        let callback = |out: Option<&mut [u8]>, _: Option<&[u8]>, frames: u32, _: f64, _: StreamStatus| {
            if let Some(out) = out {
                for (i, chunk) in out.chunks_exact_mut(4).enumerate().take(frames as usize) {
                    let value = if i % 2 == 0 { 0.5f32 } else { -0.5f32 };
                    chunk.copy_from_slice(&value.to_ne_bytes());
                }
            }
            CallbackResult::Continue
        };

        let mut adapter = FormatAdapter::new(Box::new(callback), Some(plan), None);
        assert!(!adapter.is_passthrough());
        adapter.prepare(4);

        let mut device = vec![0u8; 8];
        let result = adapter.process(Some(device.as_mut_slice()), None, 4, 0.0, StreamStatus::OK);
        assert_eq!(result, CallbackResult::Continue);
        assert_eq!(i16_values(&device), vec![16384, -16384, 16384, -16384]);
    }

    #[test]
    fn test_format_adapter_converts_input() {
        let params = StreamParameters::new(0, 1);
        let plan = ConversionPlan::new(SampleFormat::Float32, SampleFormat::Int16, &params, true);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = move |_: Option<&mut [u8]>, input: Option<&[u8]>, _: u32, _: f64, _: StreamStatus| {
            if let Some(input) = input {
                sink.lock().unwrap().extend(f32_values(input));
            }
            CallbackResult::Stop
        };

        let mut adapter = FormatAdapter::new(Box::new(callback), None, Some(plan));
        adapter.prepare(2);
        let device: Vec<u8> = [16384i16, -32768].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let result = adapter.process(None, Some(device.as_slice()), 2, 0.0, StreamStatus::OK);

        assert_eq!(result, CallbackResult::Stop);
        assert_eq!(*seen.lock().unwrap(), vec![0.5, -1.0]);
    }
}
