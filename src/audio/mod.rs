pub mod backends;
pub mod buffer;
pub mod convert;
pub mod device;
pub mod interface;
pub mod registry;
pub mod stream;

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::Result;
use crate::models::{ApiType, CallbackResult, SampleFormat, StreamState, StreamStatus};

pub use buffer::{RingBuffer, RingConsumer, RingProducer};
pub use convert::{ConversionPlan, FormatAdapter};
pub use device::{generic_sample_rates, DeviceInfo};
pub use interface::Interface;
pub use registry::{BackendEntry, BackendFactory, BackendRegistry};
pub use stream::{Flags, StreamOptions, StreamParameters, StreamShared};

/// Real-time data path supplied by the application.
///
/// `process` runs once per quantum on the backend's thread and must not
/// block or allocate. `prepare` runs on the control thread once the backend
/// has negotiated the quantum size, before the first `process`.
pub trait StreamCallback: Send {
    fn prepare(&mut self, _buffer_frames: u32) {}

    fn process(
        &mut self,
        output: Option<&mut [u8]>,
        input: Option<&[u8]>,
        frames: u32,
        stream_time: f64,
        status: StreamStatus,
    ) -> CallbackResult;
}

impl<F> StreamCallback for F
where
    F: FnMut(Option<&mut [u8]>, Option<&[u8]>, u32, f64, StreamStatus) -> CallbackResult + Send,
{
    fn process(
        &mut self,
        output: Option<&mut [u8]>,
        input: Option<&[u8]>,
        frames: u32,
        stream_time: f64,
        status: StreamStatus,
    ) -> CallbackResult {
        self(output, input, frames, stream_time, status)
    }
}

/// Box a closure as a [`StreamCallback`]
pub fn boxed_callback<F>(callback: F) -> Box<dyn StreamCallback>
where
    F: FnMut(Option<&mut [u8]>, Option<&[u8]>, u32, f64, StreamStatus) -> CallbackResult
        + Send
        + 'static,
{
    Box::new(callback)
}

/// Invoke the callback for one quantum without letting a panic cross into
/// the backend's thread. `None` means the callback panicked; the stream must
/// then stop as if it had returned `Abort` and move to `Error`.
pub fn guarded_process(
    callback: &mut dyn StreamCallback,
    output: Option<&mut [u8]>,
    input: Option<&[u8]>,
    frames: u32,
    stream_time: f64,
    status: StreamStatus,
) -> Option<CallbackResult> {
    catch_unwind(AssertUnwindSafe(|| {
        callback.process(output, input, frames, stream_time, status)
    }))
    .ok()
}

/// Best-effort real-time scheduling for the calling thread.
/// Returns whether the platform accepted the request.
#[cfg(unix)]
pub fn promote_current_thread(priority: Option<i32>) -> bool {
    // SAFETY: plain libc calls on the current thread with a zeroed, then
    // filled, sched_param.
    unsafe {
        let policy = libc::SCHED_RR;
        let max = libc::sched_get_priority_max(policy);
        let min = libc::sched_get_priority_min(policy);
        if max < 0 || min < 0 {
            return false;
        }
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority.unwrap_or(max - 10).clamp(min, max);
        libc::pthread_setschedparam(libc::pthread_self(), policy, &param) == 0
    }
}

#[cfg(not(unix))]
pub fn promote_current_thread(_priority: Option<i32>) -> bool {
    false
}

/// Contract every backend implements.
///
/// Device indexes are stable between two calls as long as the hardware set
/// does not change. A failing `open_stream` must leave the backend with no
/// stream (`StreamState::Closed`). `start_stream`, `stop_stream` and
/// `close_stream` are no-ops when the stream is already in the target state.
pub trait Api: Send {
    fn api_type(&self) -> ApiType;

    fn device_count(&mut self) -> usize;

    fn device_info(&mut self, index: usize) -> Result<DeviceInfo>;

    /// Every device in enumeration order; empty when there are none
    fn probe_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        (0..self.device_count())
            .map(|index| self.device_info(index))
            .collect()
    }

    fn default_input_device(&mut self) -> Option<usize>;

    fn default_output_device(&mut self) -> Option<usize>;

    /// Open a stream with plain interleaved buffers in a native `format`.
    ///
    /// `buffer_frames` carries the requested quantum size in and the
    /// negotiated one out. The backend calls `callback.prepare` with the
    /// negotiated size before returning.
    #[allow(clippy::too_many_arguments)]
    fn open_stream(
        &mut self,
        output: Option<&StreamParameters>,
        input: Option<&StreamParameters>,
        format: SampleFormat,
        sample_rate: u32,
        buffer_frames: &mut u32,
        options: &StreamOptions,
        callback: Box<dyn StreamCallback>,
    ) -> Result<()>;

    fn start_stream(&mut self) -> Result<()>;

    /// Orderly stop; waits for the quantum in flight to finish
    fn stop_stream(&mut self) -> Result<()>;

    /// Immediate stop without draining queued output
    fn abort_stream(&mut self) -> Result<()>;

    fn close_stream(&mut self) -> Result<()>;

    /// Replace the callback of an open stream that is not running
    fn set_stream_callback(&mut self, callback: Box<dyn StreamCallback>) -> Result<()>;

    fn stream_state(&self) -> StreamState;

    fn is_stream_running(&self) -> bool {
        self.stream_state() == StreamState::Running
    }

    /// Seconds since the stream first started
    fn stream_time(&self) -> f64;

    /// Total latency in frames, input plus output for duplex streams
    fn stream_latency(&self) -> u64;

    fn stream_sample_rate(&self) -> u32;

    fn xrun_count(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_is_stream_callback() {
        let mut calls = 0u32;
        let mut callback = boxed_callback(move |out, _, frames, _, _| {
            calls += 1;
            if let Some(out) = out {
                out.fill(1);
            }
            if calls == 2 || frames == 0 {
                CallbackResult::Stop
            } else {
                CallbackResult::Continue
            }
        });

        let mut buffer = [0u8; 4];
        callback.prepare(1);
        assert_eq!(
            callback.process(Some(&mut buffer[..]), None, 1, 0.0, StreamStatus::OK),
            CallbackResult::Continue
        );
        assert_eq!(buffer, [1, 1, 1, 1]);
        assert_eq!(
            callback.process(None, None, 1, 0.0, StreamStatus::OK),
            CallbackResult::Stop
        );
    }

    #[test]
    fn test_guarded_process_catches_panics() {
        let mut callback = boxed_callback(|_, _, frames, _, _| {
            if frames > 4 {
                panic!("callback failure");
            }
            CallbackResult::Continue
        });

        assert_eq!(
            guarded_process(callback.as_mut(), None, None, 1, 0.0, StreamStatus::OK),
            Some(CallbackResult::Continue)
        );
        assert_eq!(
            guarded_process(callback.as_mut(), None, None, 8, 0.0, StreamStatus::OK),
            None
        );
    }
}
