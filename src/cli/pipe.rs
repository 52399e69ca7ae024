//! Raw sample pipes between standard I/O and a single-direction stream.
//!
//! The real-time callback only touches a [`RingBuffer`]; a plain thread on
//! the other side moves bytes between the ring and the pipe.

use log::{debug, info, warn};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::{
    boxed_callback, Interface, RingBuffer, RingConsumer, RingProducer, StreamCallback,
    StreamParameters,
};
use crate::cli::StreamSettings;
use crate::error::{OrchestraError, ToolError};
use crate::error_recovery::{RecoveryResult, RecoveryUtils, StreamRequest};
use crate::models::{CallbackResult, Mode, StreamState};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const FEED_CHUNK_FRAMES: usize = 512;

/// What a pipe moved before it ended
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipeReport {
    /// Bytes read from or written to the pipe
    pub bytes: u64,
    pub frames: u64,
    pub stream_time: f64,
    pub xruns: u64,
    /// Quanta the ring could not fill while the pipe was still open
    pub underruns: u64,
    /// Quanta the ring could not take in full
    pub overruns: u64,
}

impl PipeReport {
    pub fn summary(&self) -> String {
        format!(
            "{} frame(s), {:.3}s stream time, {} xrun(s), {} underrun(s), {} overrun(s)",
            self.frames, self.stream_time, self.xruns, self.underruns, self.overruns
        )
    }
}

fn ring_frames(settings: &StreamSettings) -> usize {
    settings.buffer_frames.max(1024) as usize * settings.number_of_buffers.max(2) as usize
}

/// Open `mode` on `request.device_id`. With `--fallback`, an
/// `InvalidParameter` refusal is retried once with the closest request the
/// device reports; `build` is called again so ring sizes follow the retry.
fn open_direction<T>(
    interface: &mut Interface,
    mode: Mode,
    request: StreamRequest,
    settings: &StreamSettings,
    build: &mut dyn FnMut(&StreamRequest) -> (Box<dyn StreamCallback>, T),
) -> Result<(StreamRequest, u32, T), ToolError> {
    match try_open(interface, mode, &request, settings, build) {
        Ok((frames, half)) => Ok((request, frames, half)),
        Err(OrchestraError::InvalidParameter(reason)) if settings.fallback => {
            warn!("{}; looking for the closest supported request", reason);
            let device = interface.device_info(request.device_id)?;
            match RecoveryUtils::suggest_request(&device, mode, &request) {
                RecoveryResult::Adjusted(adjusted, changes) => {
                    for change in &changes {
                        warn!("fallback: {}", change);
                    }
                    let (frames, half) = try_open(interface, mode, &adjusted, settings, build)?;
                    Ok((adjusted, frames, half))
                }
                RecoveryResult::Unchanged => Err(OrchestraError::InvalidParameter(reason).into()),
                RecoveryResult::Failed(why) => Err(OrchestraError::InvalidParameter(format!(
                    "{}; {}",
                    reason, why
                ))
                .into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn try_open<T>(
    interface: &mut Interface,
    mode: Mode,
    request: &StreamRequest,
    settings: &StreamSettings,
    build: &mut dyn FnMut(&StreamRequest) -> (Box<dyn StreamCallback>, T),
) -> Result<(u32, T), OrchestraError> {
    let params = StreamParameters::new(request.device_id, request.channels)
        .with_first_channel(request.first_channel);
    let (output, input) = if mode.has_output() {
        (Some(&params), None)
    } else {
        (None, Some(&params))
    };
    let (callback, half) = build(request);
    let mut frames = settings.buffer_frames;
    interface.open_stream_boxed(
        output,
        input,
        request.format,
        request.sample_rate,
        &mut frames,
        &settings.options(),
        callback,
    )?;
    Ok((frames, half))
}

fn stream_failed() -> ToolError {
    ToolError::Audio(OrchestraError::DriverError(
        "the audio stream stopped with an error".to_string(),
    ))
}

/// Play interleaved samples from `reader` until it ends or `stop` is set.
///
/// A trailing partial frame is discarded.
pub fn run_playback<R>(
    interface: &mut Interface,
    settings: &StreamSettings,
    mut reader: R,
    stop: Arc<AtomicBool>,
) -> Result<PipeReport, ToolError>
where
    R: Read + Send + 'static,
{
    let device = settings.resolve_device(interface, Mode::Output)?;
    let capacity = ring_frames(settings);
    let (request, frames, producer) = open_direction(
        interface,
        Mode::Output,
        settings.request(device),
        settings,
        &mut |request| {
            let (producer, mut consumer) = RingBuffer::new(capacity, request.frame_bytes()).split();
            let callback = boxed_callback(move |output, _, _, _, _| {
                if let Some(output) = output {
                    consumer.pull_or_silence(output);
                }
                if consumer.is_drained() {
                    CallbackResult::Stop
                } else {
                    CallbackResult::Continue
                }
            });
            (callback, producer)
        },
    )?;
    info!(
        "playing {} channel(s) of {} at {} Hz on device {} ({} frames per quantum)",
        request.channels, request.format, request.sample_rate, request.device_id, frames
    );

    let ring = producer.shared();
    let fed = Arc::new(AtomicU64::new(0));
    let feeder = {
        let fed = Arc::clone(&fed);
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("orchestra-stdin".to_string())
            .spawn(move || {
                let mut producer = producer;
                feed_ring(&mut reader, &mut producer, &fed, &stop)
            })?
    };

    // Prefill one quantum so the first callback has data
    let prefill = frames.max(1) as usize * ring.frame_bytes();
    while ring.available_read() < prefill && !ring.is_closed() && !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(1));
    }

    interface.start_stream()?;
    while interface.is_stream_running() && !stop.load(Ordering::Relaxed) {
        thread::sleep(POLL_INTERVAL);
    }

    let failed = interface.stream_state() == StreamState::Error;
    if !failed {
        interface.stop_stream()?;
    }

    // The feeder may still be blocked on the pipe after an interruption
    let feed_result = if ring.is_closed() {
        feeder
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::new(ErrorKind::Other, "stdin reader panicked")))
    } else {
        debug!("leaving the stdin reader behind");
        Ok(())
    };

    let bytes = fed.load(Ordering::Relaxed);
    let report = PipeReport {
        bytes,
        frames: bytes / request.frame_bytes() as u64,
        stream_time: interface.stream_time(),
        xruns: interface.xrun_count(),
        underruns: ring.underrun_count(),
        overruns: ring.overrun_count(),
    };
    interface.close_stream()?;

    if failed {
        return Err(stream_failed());
    }
    feed_result?;
    info!("playback finished: {}", report.summary());
    Ok(report)
}

/// Copy whole frames from `reader` into the ring, waiting while it is full
fn feed_ring<R: Read>(
    reader: &mut R,
    producer: &mut RingProducer,
    fed: &AtomicU64,
    stop: &AtomicBool,
) -> std::io::Result<()> {
    let frame_bytes = producer.ring().frame_bytes();
    let mut chunk = vec![0u8; frame_bytes * FEED_CHUNK_FRAMES];
    let mut filled = 0;

    loop {
        let read = match reader.read(&mut chunk[filled..]) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        filled += read;

        let whole = filled - filled % frame_bytes;
        let mut offset = 0;
        while offset < whole {
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            let written = producer.write(&chunk[offset..whole]);
            offset += written;
            fed.fetch_add(written as u64, Ordering::Relaxed);
            if written == 0 {
                thread::sleep(Duration::from_millis(2));
            }
        }
        chunk.copy_within(whole..filled, 0);
        filled -= whole;
    }

    if filled > 0 {
        warn!("discarding {} byte(s) of an incomplete trailing frame", filled);
    }
    Ok(())
}

/// Bytes of `duration` at `sample_rate`, saturating for absurd durations
pub(crate) fn capture_limit(duration: Duration, sample_rate: u32, frame_bytes: usize) -> u64 {
    // Float to int casts saturate
    let frames = (duration.as_secs_f64() * f64::from(sample_rate)).round() as u64;
    frames.saturating_mul(frame_bytes as u64)
}

/// Record interleaved samples to `writer` until `duration` has been
/// captured, `stop` is set, or the stream ends.
pub fn run_capture<W: Write>(
    interface: &mut Interface,
    settings: &StreamSettings,
    mut writer: W,
    stop: Arc<AtomicBool>,
    duration: Option<Duration>,
) -> Result<PipeReport, ToolError> {
    let device = settings.resolve_device(interface, Mode::Input)?;
    let capacity = ring_frames(settings);
    let (request, frames, mut consumer) = open_direction(
        interface,
        Mode::Input,
        settings.request(device),
        settings,
        &mut |request| {
            let (mut producer, consumer) = RingBuffer::new(capacity, request.frame_bytes()).split();
            let callback = boxed_callback(move |_, input, _, _, _| {
                if let Some(input) = input {
                    producer.push_or_drop(input);
                }
                CallbackResult::Continue
            });
            (callback, consumer)
        },
    )?;
    info!(
        "recording {} channel(s) of {} at {} Hz from device {} ({} frames per quantum)",
        request.channels, request.format, request.sample_rate, request.device_id, frames
    );

    let frame_bytes = request.frame_bytes();
    let limit = duration.map(|duration| capture_limit(duration, request.sample_rate, frame_bytes));
    let mut chunk = vec![0u8; frame_bytes * frames.max(FEED_CHUNK_FRAMES as u32) as usize];
    let mut bytes = 0u64;

    let mut drain = |consumer: &mut RingConsumer,
                     writer: &mut W,
                     bytes: &mut u64|
     -> std::io::Result<usize> {
        let room = limit.map_or(chunk.len() as u64, |limit| limit.saturating_sub(*bytes));
        let want = (room.min(chunk.len() as u64)) as usize;
        let read = consumer.read(&mut chunk[..want]);
        if read > 0 {
            writer.write_all(&chunk[..read])?;
            *bytes += read as u64;
        }
        Ok(read)
    };

    interface.start_stream()?;
    let mut result = Ok(());
    while !stop.load(Ordering::Relaxed)
        && interface.is_stream_running()
        && limit.map_or(true, |limit| bytes < limit)
    {
        match drain(&mut consumer, &mut writer, &mut bytes) {
            Ok(0) => thread::sleep(POLL_INTERVAL),
            Ok(_) => {}
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    let failed = interface.stream_state() == StreamState::Error;
    if !failed {
        interface.stop_stream()?;
    }
    if result.is_ok() {
        // Whatever the last quanta left in the ring
        loop {
            match drain(&mut consumer, &mut writer, &mut bytes) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
    }
    let result = result.and_then(|_| writer.flush());

    let report = PipeReport {
        bytes,
        frames: bytes / frame_bytes as u64,
        stream_time: interface.stream_time(),
        xruns: interface.xrun_count(),
        underruns: consumer.ring().underrun_count(),
        overruns: consumer.ring().overrun_count(),
    };
    interface.close_stream()?;

    if failed {
        return Err(stream_failed());
    }
    result?;
    info!("recording finished: {}", report.summary());
    Ok(report)
}
