use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Single-producer single-consumer byte ring with atomic read/write positions.
///
/// Transfers are whole frames only, so a reader never sees half a sample.
/// Obtain the two halves with [`RingBuffer::split`]; each half is `Send` and
/// exactly one thread may own it.
#[derive(Debug)]
pub struct RingBuffer {
    buffer: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    frame_bytes: usize,
    // Monotonic byte counters; the slot index is `pos % capacity`
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
    closed: AtomicBool,
    underruns: AtomicU64,
    overruns: AtomicU64,
}

// SAFETY: the producer only writes the free region and the consumer only
// reads the filled region; positions are published with Release and
// observed with Acquire, so no byte is accessed by both sides at once.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Ring holding `capacity_frames` frames of `frame_bytes` bytes each
    pub fn new(capacity_frames: usize, frame_bytes: usize) -> Self {
        let frame_bytes = frame_bytes.max(1);
        let capacity = capacity_frames.max(1) * frame_bytes;
        Self {
            buffer: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            frame_bytes,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    /// Split into the two ends
    pub fn split(self) -> (RingProducer, RingConsumer) {
        let shared = Arc::new(self);
        (
            RingProducer {
                ring: Arc::clone(&shared),
            },
            RingConsumer { ring: shared },
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity / self.frame_bytes
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Bytes available for reading
    pub fn available_read(&self) -> usize {
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        write_pos.wrapping_sub(read_pos)
    }

    /// Bytes available for writing
    pub fn available_write(&self) -> usize {
        self.capacity - self.available_read()
    }

    pub fn is_empty(&self) -> bool {
        self.available_read() == 0
    }

    pub fn is_full(&self) -> bool {
        self.available_write() == 0
    }

    /// Fill level from 0.0 to 1.0
    pub fn fill_level(&self) -> f32 {
        self.available_read() as f32 / self.capacity as f32
    }

    /// Producer finished; the consumer drains what is left
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn overrun_count(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    fn whole_frames(&self, bytes: usize) -> usize {
        bytes - bytes % self.frame_bytes
    }

    fn write(&self, data: &[u8]) -> usize {
        let to_write = self.whole_frames(data.len().min(self.available_write()));
        if to_write == 0 {
            return 0;
        }

        let write_pos = self.write_pos.load(Ordering::Relaxed);
        let start = write_pos % self.capacity;
        let first_chunk = to_write.min(self.capacity - start);
        let second_chunk = to_write - first_chunk;

        // SAFETY: [start, start + to_write) modulo capacity is free space
        // owned by the single producer until write_pos is published.
        unsafe {
            let buffer_ptr = (*self.buffer.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(data.as_ptr(), buffer_ptr.add(start), first_chunk);
            if second_chunk > 0 {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first_chunk),
                    buffer_ptr,
                    second_chunk,
                );
            }
        }

        self.write_pos
            .store(write_pos.wrapping_add(to_write), Ordering::Release);
        to_write
    }

    fn read(&self, data: &mut [u8]) -> usize {
        let to_read = self.whole_frames(data.len().min(self.available_read()));
        if to_read == 0 {
            return 0;
        }

        let read_pos = self.read_pos.load(Ordering::Relaxed);
        let start = read_pos % self.capacity;
        let first_chunk = to_read.min(self.capacity - start);
        let second_chunk = to_read - first_chunk;

        // SAFETY: the filled region is owned by the single consumer until
        // read_pos is published.
        unsafe {
            let buffer_ptr = (*self.buffer.get()).as_ptr();
            std::ptr::copy_nonoverlapping(buffer_ptr.add(start), data.as_mut_ptr(), first_chunk);
            if second_chunk > 0 {
                std::ptr::copy_nonoverlapping(
                    buffer_ptr,
                    data.as_mut_ptr().add(first_chunk),
                    second_chunk,
                );
            }
        }

        self.read_pos
            .store(read_pos.wrapping_add(to_read), Ordering::Release);
        to_read
    }
}

/// Writing end of a [`RingBuffer`]
#[derive(Debug)]
pub struct RingProducer {
    ring: Arc<RingBuffer>,
}

impl RingProducer {
    /// Copy as many whole frames as fit; returns the bytes written
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.ring.write(data)
    }

    /// Real-time variant: whatever does not fit is dropped and counted
    pub fn push_or_drop(&mut self, data: &[u8]) -> usize {
        let written = self.ring.write(data);
        if written < self.ring.whole_frames(data.len()) {
            self.ring.overruns.fetch_add(1, Ordering::Relaxed);
        }
        written
    }

    pub fn available_write(&self) -> usize {
        self.ring.available_write()
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Handle for watching fill level and counters from another thread
    pub fn shared(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring)
    }

    /// Mark the end of data
    pub fn close(&self) {
        self.ring.closed.store(true, Ordering::Release);
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reading end of a [`RingBuffer`]
#[derive(Debug)]
pub struct RingConsumer {
    ring: Arc<RingBuffer>,
}

impl RingConsumer {
    /// Copy up to `data.len()` bytes of whole frames; returns the bytes read
    pub fn read(&mut self, data: &mut [u8]) -> usize {
        self.ring.read(data)
    }

    /// Real-time variant: the part of `data` the ring cannot fill is
    /// zeroed and counted as an underrun unless the producer has closed.
    pub fn pull_or_silence(&mut self, data: &mut [u8]) -> usize {
        let read = self.ring.read(data);
        if read < data.len() {
            data[read..].fill(0);
            if !self.ring.is_closed() {
                self.ring.underruns.fetch_add(1, Ordering::Relaxed);
            }
        }
        read
    }

    pub fn available_read(&self) -> usize {
        self.ring.available_read()
    }

    /// Producer closed and every byte consumed
    pub fn is_drained(&self) -> bool {
        self.ring.is_closed() && self.ring.is_empty()
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn shared(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring)
    }
}
