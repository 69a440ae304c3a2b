use std::time::{Duration, Instant};

/// Measures throughput for one activation of an upload item.
///
/// Only bytes acknowledged since [`ActivationMeter::start`] count, so time an
/// item spent queued or paused never dilutes the rate.
#[derive(Debug, Clone)]
pub struct ActivationMeter {
    started: Instant,
    bytes: u64,
}

impl ActivationMeter {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn bytes_per_second(&self) -> f64 {
        throughput(self.bytes, self.started.elapsed())
    }
}

/// Bytes per second; 0.0 before any time has passed.
pub fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    bytes as f64 / elapsed.as_secs_f64()
}

/// Estimated time to send `remaining` bytes, `None` when the rate is unknown.
pub fn eta(remaining: u64, bytes_per_second: f64) -> Option<Duration> {
    if bytes_per_second <= 0.0 || !bytes_per_second.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64(remaining as f64 / bytes_per_second))
}

/// Byte range `[start, end)` of chunk `index`.
pub fn chunk_bounds(index: u32, chunk_size: u64, file_size: u64) -> (u64, u64) {
    let start = (index as u64 * chunk_size).min(file_size);
    let end = (start + chunk_size).min(file_size);
    (start, end)
}

/// Number of chunks for a file; an empty file still travels as one empty chunk.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> u32 {
    file_size.div_ceil(chunk_size.max(1)).max(1) as u32
}
