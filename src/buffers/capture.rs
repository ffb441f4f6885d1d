//! Capture ring: a per-source time-indexed byte ring supporting sub-second
//! `read_segment` extraction across wrap boundaries, used by the external
//! archiver to pull arbitrary past segments.

use crate::error::{IngestError, Result};
use crate::registry::SourceId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

const ALIGNMENT: usize = 2048;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

fn round_up_to_alignment(n: usize) -> usize {
    let rem = n % ALIGNMENT;
    if rem == 0 {
        n
    } else {
        n + (ALIGNMENT - rem)
    }
}

struct Inner {
    buffer: Vec<u8>,
    /// One monotonically-tagged entry per sample slot, parallel to `buffer`
    /// at `bytes_per_sample` granularity.
    sample_indices: Vec<u64>,
    last_sample_idx: u64,
    write_index: usize,
    start_time: Option<DateTime<Utc>>,
}

/// A sub-second-precise extract from the capture ring.
#[derive(Debug, Clone)]
pub struct CaptureSegment {
    pub bytes: Vec<u8>,
    pub start_sample_idx: u64,
    pub end_sample_idx: u64,
    /// Byte offsets within `bytes` at which the underlying sample index
    /// broke monotonicity (data was overwritten mid-window).
    pub discontinuities: Vec<usize>,
}

pub struct CaptureRing {
    sample_rate: u32,
    bytes_per_sample: usize,
    buffer_duration: Duration,
    buf_size: usize,
    inner: Mutex<Inner>,
}

impl CaptureRing {
    pub fn new(duration: Duration, sample_rate: u32, bytes_per_sample: usize) -> Self {
        let raw = (duration.as_secs_f64() * sample_rate as f64 * bytes_per_sample as f64).ceil() as usize;
        let buf_size = round_up_to_alignment(raw.max(ALIGNMENT));
        let num_samples = buf_size / bytes_per_sample;
        CaptureRing {
            sample_rate,
            bytes_per_sample,
            buffer_duration: duration,
            buf_size,
            inner: Mutex::new(Inner {
                buffer: vec![0u8; buf_size],
                sample_indices: vec![0u64; num_samples],
                last_sample_idx: 0,
                write_index: 0,
                start_time: None,
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buf_size
    }

    /// Write raw PCM bytes, advancing the ring and sample-index tracking.
    /// Rebases `start_time` on wrap so that `now - start_time <=
    /// buffer_duration` always holds.
    pub fn write(&self, bytes: &[u8]) {
        let bps = self.bytes_per_sample;
        let usable_len = bytes.len() - (bytes.len() % bps);
        if usable_len == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.start_time.is_none() {
            inner.start_time = Some(Utc::now());
        }

        let buf_size = self.buf_size;
        let num_samples = inner.sample_indices.len();
        let prev_write_index = inner.write_index;
        let base_sample_idx = inner.last_sample_idx;

        for (sample_offset, chunk) in bytes[..usable_len].chunks(bps).enumerate() {
            let byte_pos = (prev_write_index + sample_offset * bps) % buf_size;
            inner.buffer[byte_pos..byte_pos + bps].copy_from_slice(chunk);
            let slot = (byte_pos / bps) % num_samples;
            inner.sample_indices[slot] = base_sample_idx + sample_offset as u64;
        }

        let samples_written = usable_len / bps;
        inner.last_sample_idx = base_sample_idx + samples_written as u64;
        inner.write_index = (prev_write_index + usable_len) % buf_size;

        if inner.write_index <= prev_write_index {
            let now = Utc::now();
            inner.start_time = Some(now - chrono::Duration::from_std(self.buffer_duration).unwrap());
        }
    }

    /// Extract the segment starting at `requested_start` and spanning
    /// `duration_seconds`. Index math is done in floating point before
    /// truncation to preserve sub-second precision. Waits in 1s polls if
    /// the window hasn't fully arrived yet.
    pub async fn read_segment(
        &self,
        requested_start: DateTime<Utc>,
        duration_seconds: f64,
    ) -> Result<CaptureSegment> {
        let requested_end =
            requested_start + chrono::Duration::milliseconds((duration_seconds * 1000.0).round() as i64);
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if inner.start_time.is_none() {
                    return Err(IngestError::NotFound("capture ring has no data yet".into()));
                }
                if Utc::now() >= requested_end {
                    return self.extract_locked(&inner, requested_start, duration_seconds);
                }
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    fn extract_locked(
        &self,
        inner: &Inner,
        requested_start: DateTime<Utc>,
        duration_seconds: f64,
    ) -> Result<CaptureSegment> {
        let start_time = inner.start_time.ok_or_else(|| {
            IngestError::NotFound("capture ring has no data yet".to_string())
        })?;
        let offset_nanos = (requested_start - start_time)
            .num_nanoseconds()
            .ok_or_else(|| IngestError::Validation("requested offset out of range".into()))?;
        if offset_nanos < 0 {
            return Err(IngestError::Validation(
                "requested_start precedes the buffer's retained window".to_string(),
            ));
        }
        let offset_seconds = offset_nanos as f64 / 1_000_000_000.0;
        if offset_seconds > self.buffer_duration.as_secs_f64() {
            return Err(IngestError::Validation(
                "requested_start is outside the retained capture window".to_string(),
            ));
        }

        let bps = self.bytes_per_sample;
        let start_index = (offset_seconds * self.sample_rate as f64 * bps as f64) as usize;
        let length = ((duration_seconds * self.sample_rate as f64 * bps as f64).round() as usize)
            .min(self.buf_size);

        let buf_size = self.buf_size;
        let start_mod = start_index % buf_size;

        let mut bytes = Vec::with_capacity(length);
        let mut sample_slots = Vec::with_capacity(length / bps + 1);

        if start_mod + length <= buf_size {
            bytes.extend_from_slice(&inner.buffer[start_mod..start_mod + length]);
            self.collect_slots(inner, start_mod, length, &mut sample_slots);
        } else {
            let first_len = buf_size - start_mod;
            bytes.extend_from_slice(&inner.buffer[start_mod..buf_size]);
            bytes.extend_from_slice(&inner.buffer[0..length - first_len]);
            self.collect_slots(inner, start_mod, first_len, &mut sample_slots);
            self.collect_slots(inner, 0, length - first_len, &mut sample_slots);
        }

        let mut discontinuities = Vec::new();
        for i in 1..sample_slots.len() {
            if sample_slots[i] != sample_slots[i - 1] + 1 {
                discontinuities.push(i * bps);
            }
        }

        let start_sample_idx = *sample_slots.first().unwrap_or(&0);
        let end_sample_idx = *sample_slots.last().unwrap_or(&start_sample_idx);

        Ok(CaptureSegment {
            bytes,
            start_sample_idx,
            end_sample_idx,
            discontinuities,
        })
    }

    fn collect_slots(&self, inner: &Inner, byte_start: usize, byte_len: usize, out: &mut Vec<u64>) {
        let bps = self.bytes_per_sample;
        let num_samples = inner.sample_indices.len();
        let first_slot = byte_start / bps;
        let count = byte_len / bps;
        for i in 0..count {
            out.push(inner.sample_indices[(first_slot + i) % num_samples]);
        }
    }
}

/// Per-source map of capture rings, guarded by a single reader/writer
/// lock keyed by source; each ring additionally serializes its own
/// reads/writes internally.
#[derive(Default)]
pub struct CaptureRegistry {
    rings: std::sync::RwLock<HashMap<SourceId, std::sync::Arc<CaptureRing>>>,
}

impl CaptureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, source: &SourceId, duration: Duration, sample_rate: u32, bytes_per_sample: usize) -> Result<()> {
        let mut rings = self.rings.write().unwrap();
        if rings.contains_key(source) {
            return Err(IngestError::Validation(format!(
                "capture ring already allocated for {source}"
            )));
        }
        rings.insert(
            source.clone(),
            std::sync::Arc::new(CaptureRing::new(duration, sample_rate, bytes_per_sample)),
        );
        Ok(())
    }

    pub fn get(&self, source: &str) -> Option<std::sync::Arc<CaptureRing>> {
        self.rings.read().unwrap().get(source).cloned()
    }

    pub fn remove(&self, source: &str) {
        self.rings.write().unwrap().remove(source);
    }

    pub fn contains(&self, source: &str) -> bool {
        self.rings.read().unwrap().contains_key(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(ring: &CaptureRing, num_samples: usize) {
        let bytes: Vec<u8> = (0..num_samples)
            .flat_map(|i| {
                let v = (i % 256) as u8;
                [v, 0u8]
            })
            .collect();
        ring.write(&bytes);
    }

    #[test]
    fn buffer_size_rounds_up_to_2048_multiple() {
        let ring = CaptureRing::new(Duration::from_secs(1), 48000, 2);
        // 1s * 48000 * 2 = 96000, already a multiple of 2048? 96000/2048 = 46.875 -> rounds up.
        assert_eq!(ring.buffer_size() % 2048, 0);
        assert!(ring.buffer_size() >= 96000);
    }

    #[test]
    fn write_advances_sample_indices_contiguously() {
        let ring = CaptureRing::new(Duration::from_secs(5), 48000, 2);
        fill(&ring, 1000);
        let inner = ring.inner.lock().unwrap();
        assert_eq!(inner.last_sample_idx, 1000);
        for i in 0..1000u64 {
            assert_eq!(inner.sample_indices[i as usize], i);
        }
    }

    #[tokio::test]
    async fn sub_second_precision_offset_computes_correct_start_byte() {
        let ring = CaptureRing::new(Duration::from_secs(5), 48000, 2);
        // b[i] = i mod 256 pattern, one byte per i.
        let bytes: Vec<u8> = (0..48000u32 * 2).map(|i| (i % 256) as u8).collect();
        ring.write(&bytes);
        let start = {
            let inner = ring.inner.lock().unwrap();
            inner.start_time.unwrap()
        };
        let segment = ring
            .read_segment(start + chrono::Duration::milliseconds(100), 1.0)
            .await
            .unwrap();
        // offset 0.1s @ 48kHz/2B => byte index 9600.
        assert_eq!(segment.bytes[0], (9600u32 % 256) as u8);
    }

    #[tokio::test]
    async fn read_segment_before_start_time_is_rejected() {
        let ring = CaptureRing::new(Duration::from_secs(5), 48000, 2);
        fill(&ring, 100);
        let start = {
            let inner = ring.inner.lock().unwrap();
            inner.start_time.unwrap()
        };
        let err = ring
            .read_segment(start - chrono::Duration::seconds(1), 0.1)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }

    #[test]
    fn wraparound_rebases_start_time() {
        let ring = CaptureRing::new(Duration::from_millis(10), 48000, 2);
        // buf_size will round up to 2048; write enough to wrap at least twice.
        let bytes = vec![0u8; ring.buffer_size() * 2 + 16];
        ring.write(&bytes);
        let inner = ring.inner.lock().unwrap();
        let now = Utc::now();
        let elapsed = now - inner.start_time.unwrap();
        assert!(elapsed.num_milliseconds() as f64 <= ring.buffer_duration.as_secs_f64() * 1000.0 + 50.0);
    }
}
