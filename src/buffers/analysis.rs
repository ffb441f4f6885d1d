//! Analysis ring: a per-source byte ring producing fixed-size overlapping
//! chunks for the downstream detector.

use crate::error::{IngestError, Result};
use crate::registry::SourceId;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

const WRITE_RETRIES: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(10);
const FULLNESS_WARN_THRESHOLD: f64 = 0.90;
const FULLNESS_WARN_EVERY: u64 = 32;

/// Detector window sizing, derived once from settings:
/// `overlapSize = seconds × sampleRate × bytesPerSample`,
/// `readSize = chunkSize − overlapSize`.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisParams {
    pub chunk_size: usize,
    pub overlap_size: usize,
}

impl AnalysisParams {
    pub fn new(chunk_size: usize, overlap_seconds: f64, sample_rate: u32, bytes_per_sample: usize) -> Self {
        let overlap_size = (overlap_seconds * sample_rate as f64 * bytes_per_sample as f64).round() as usize;
        assert!(overlap_size < chunk_size, "overlap must be smaller than chunk size");
        AnalysisParams {
            chunk_size,
            overlap_size,
        }
    }

    pub fn read_size(&self) -> usize {
        self.chunk_size - self.overlap_size
    }
}

struct Inner {
    ring: VecDeque<u8>,
    previous_tail: Vec<u8>,
    capacity: usize,
}

/// One source's analysis ring. Writes are serialized by `inner`'s mutex;
/// `read` shares the same lock since both mutate the ring/tail together.
pub struct AnalysisRing {
    params: AnalysisParams,
    inner: Mutex<Inner>,
    dropped_batches: AtomicU64,
    fullness_crossings: AtomicU64,
}

impl AnalysisRing {
    pub fn new(capacity: usize, params: AnalysisParams) -> Self {
        AnalysisRing {
            params,
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                previous_tail: Vec::new(),
                capacity,
            }),
            dropped_batches: AtomicU64::new(0),
            fullness_crossings: AtomicU64::new(0),
        }
    }

    fn try_write_once(&self, bytes: &[u8]) -> std::result::Result<(), ()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.ring.len() + bytes.len() > inner.capacity {
            return Err(());
        }
        inner.ring.extend(bytes.iter().copied());
        let fullness = inner.ring.len() as f64 / inner.capacity as f64;
        if fullness >= FULLNESS_WARN_THRESHOLD {
            let crossing = self.fullness_crossings.fetch_add(1, Ordering::Relaxed) + 1;
            if crossing % FULLNESS_WARN_EVERY == 1 {
                warn!(fullness = %format!("{:.1}%", fullness * 100.0), "analysis ring nearing capacity");
            }
        }
        Ok(())
    }

    /// Write raw PCM bytes, retrying on `RingFull` with a short delay and
    /// dropping the batch if the ring stays full.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        for attempt in 0..=WRITE_RETRIES {
            if self.try_write_once(bytes).is_ok() {
                return Ok(());
            }
            if attempt < WRITE_RETRIES {
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
            }
        }
        self.dropped_batches.fetch_add(1, Ordering::Relaxed);
        Err(IngestError::RingFull(format!(
            "analysis ring full after {} retries, dropped {} bytes",
            WRITE_RETRIES,
            bytes.len()
        )))
    }

    /// Pop the next full overlapping chunk, if enough new bytes have
    /// arrived since the last read. `None` means "not enough data yet",
    /// not an error.
    ///
    /// The carried-over `previous_tail` holds `overlap_size` bytes from the
    /// end of the last emitted chunk (empty on the very first call), so
    /// each call only needs to drain `chunk_size - previous_tail.len()`
    /// fresh bytes from the ring to have a full `chunk_size`-byte window.
    pub fn read(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let read_size = self.params.read_size();
        let needed = self.params.chunk_size - inner.previous_tail.len();
        if inner.ring.len() < needed {
            return None;
        }
        let mut accumulated = std::mem::take(&mut inner.previous_tail);
        accumulated.extend(inner.ring.drain(..needed));
        debug_assert_eq!(accumulated.len(), self.params.chunk_size);

        let chunk = accumulated[..self.params.chunk_size].to_vec();
        inner.previous_tail = accumulated[read_size..].to_vec();
        Some(chunk)
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }
}

/// Per-source map of analysis rings, guarded by a single reader/writer
/// lock keyed by source.
#[derive(Default)]
pub struct AnalysisRegistry {
    rings: std::sync::RwLock<HashMap<SourceId, std::sync::Arc<AnalysisRing>>>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, source: &SourceId, capacity: usize, params: AnalysisParams) -> Result<()> {
        let mut rings = self.rings.write().unwrap();
        if rings.contains_key(source) {
            return Err(IngestError::Validation(format!(
                "analysis ring already allocated for {source}"
            )));
        }
        rings.insert(source.clone(), std::sync::Arc::new(AnalysisRing::new(capacity, params)));
        Ok(())
    }

    pub fn get(&self, source: &str) -> Option<std::sync::Arc<AnalysisRing>> {
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

    fn params() -> AnalysisParams {
        // chunk=10, overlap=4 -> read_size=6
        AnalysisParams {
            chunk_size: 10,
            overlap_size: 4,
        }
    }

    #[tokio::test]
    async fn emitted_chunks_are_exact_size_and_overlap() {
        let ring = AnalysisRing::new(1024, params());
        let data: Vec<u8> = (0..64u8).collect();
        ring.write(&data).await.unwrap();

        let first = ring.read().expect("first chunk");
        assert_eq!(first.len(), 10);
        let second = ring.read().expect("second chunk");
        assert_eq!(second.len(), 10);

        // Last overlap_size bytes of `first` equal first overlap_size bytes of `second`.
        assert_eq!(&first[first.len() - 4..], &second[..4]);
    }

    #[tokio::test]
    async fn read_returns_none_until_enough_bytes() {
        let ring = AnalysisRing::new(1024, params());
        ring.write(&[1, 2, 3]).await.unwrap();
        assert!(ring.read().is_none());
    }

    #[tokio::test]
    async fn write_drops_after_exhausting_retries_when_full() {
        let ring = AnalysisRing::new(8, params());
        ring.write(&[0u8; 8]).await.unwrap();
        let result = ring.write(&[1u8; 8]).await;
        assert!(result.is_err());
        assert_eq!(ring.dropped_batches(), 1);
    }

    #[test]
    fn allocate_rejects_duplicate_source() {
        let registry = AnalysisRegistry::new();
        registry.allocate(&"s1".to_string(), 1024, params()).unwrap();
        let err = registry.allocate(&"s1".to_string(), 1024, params()).unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }
}
