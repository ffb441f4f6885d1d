//! Audio-level meter: per-batch RMS/clipping computation with adaptive
//! back-pressure on the level channel.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);
const MAX_INTERVAL: Duration = Duration::from_secs(2);
const FULLNESS_DOUBLE_THRESHOLD: f64 = 0.50;
const FULLNESS_PIN_THRESHOLD: f64 = 0.90;
const FULLNESS_LOW_THRESHOLD: f64 = 0.25;
const PIN_SAMPLE_EVERY: u64 = 10;

/// One level observation for a source, emitted on its level channel.
#[derive(Debug, Clone, Serialize)]
pub struct AudioLevelData {
    pub source: String,
    pub name: String,
    pub level: u8,
    pub clipping: bool,
}

/// Result of analyzing one PCM batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelReading {
    pub level: u8,
    pub clipping: bool,
}

/// Compute RMS/clipping for a batch of 16-bit little-endian samples. Trims
/// a trailing odd byte if present.
pub fn analyze_batch(bytes: &[u8]) -> LevelReading {
    let usable = bytes.len() - (bytes.len() % 2);
    if usable == 0 {
        return LevelReading {
            level: 0,
            clipping: false,
        };
    }

    let mut sum_squares: f64 = 0.0;
    let mut clipping = false;
    let mut count: u64 = 0;

    for chunk in bytes[..usable].chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        if sample == i16::MAX || sample == i16::MIN {
            clipping = true;
        }
        sum_squares += (sample as f64) * (sample as f64);
        count += 1;
    }

    let rms = (sum_squares / count.max(1) as f64).sqrt();
    let dbfs = if rms > 0.0 {
        20.0 * (rms / 32768.0).log10()
    } else {
        -f64::INFINITY
    };
    let mut level = ((dbfs + 60.0) * 2.0).clamp(0.0, 100.0);
    if clipping {
        level = level.max(95.0);
    }

    LevelReading {
        level: level.round() as u8,
        clipping,
    }
}

/// Per-channel adaptive sampling state, shared by one source's level meter
/// and its sender half.
struct Throttle {
    last_sent: Option<Instant>,
    sample_interval: Duration,
    consecutive_full_attempts: u64,
}

impl Default for Throttle {
    fn default() -> Self {
        Throttle {
            last_sent: None,
            sample_interval: DEFAULT_INTERVAL,
            consecutive_full_attempts: 0,
        }
    }
}

/// Emits [`AudioLevelData`] on a bounded channel with adaptive sampling:
/// the interval widens as the channel fills and narrows again once it
/// drains, and sends are always non-blocking (a full channel silently
/// drops the sample).
pub struct LevelMeter {
    source: String,
    name: String,
    tx: mpsc::Sender<AudioLevelData>,
    throttle: Mutex<Throttle>,
}

impl LevelMeter {
    pub fn new(source: String, name: String, tx: mpsc::Sender<AudioLevelData>) -> Self {
        LevelMeter {
            source,
            name,
            tx,
            throttle: Mutex::new(Throttle::default()),
        }
    }

    fn channel_fullness(&self) -> f64 {
        let cap = self.tx.capacity();
        let max = self.tx.max_capacity();
        if max == 0 {
            0.0
        } else {
            1.0 - (cap as f64 / max as f64)
        }
    }

    fn adapt(&self, throttle: &mut Throttle) {
        let fullness = self.channel_fullness();
        if fullness >= FULLNESS_PIN_THRESHOLD {
            throttle.sample_interval = MAX_INTERVAL;
        } else if fullness >= FULLNESS_DOUBLE_THRESHOLD {
            throttle.sample_interval = (throttle.sample_interval * 2).min(MAX_INTERVAL);
        } else if fullness < FULLNESS_LOW_THRESHOLD && throttle.sample_interval > DEFAULT_INTERVAL {
            throttle.sample_interval = (throttle.sample_interval / 2).max(DEFAULT_INTERVAL);
        }
    }

    /// Analyze `bytes` and, if the adaptive sampler decides this is a send
    /// instant, emit the reading. Never blocks; drops silently on a full
    /// channel.
    pub fn observe(&self, bytes: &[u8]) {
        let reading = analyze_batch(bytes);
        let mut throttle = self.throttle.lock().unwrap();
        self.adapt(&mut throttle);

        let fullness = self.channel_fullness();
        let due = match throttle.last_sent {
            None => true,
            Some(last) => last.elapsed() >= throttle.sample_interval,
        };
        if !due {
            return;
        }

        if fullness >= FULLNESS_PIN_THRESHOLD {
            throttle.consecutive_full_attempts += 1;
            if throttle.consecutive_full_attempts % PIN_SAMPLE_EVERY != 0 {
                return;
            }
        } else {
            throttle.consecutive_full_attempts = 0;
        }

        throttle.last_sent = Some(Instant::now());
        let data = AudioLevelData {
            source: self.source.clone(),
            name: self.name.clone(),
            level: reading.level,
            clipping: reading.clipping,
        };
        // Non-blocking by construction: a full channel drops the sample.
        let _ = self.tx.try_send(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples_at(level_frac: f64, n: usize) -> Vec<u8> {
        let amp = (i16::MAX as f64 * level_frac) as i16;
        let mut out = Vec::with_capacity(n * 2);
        for i in 0..n {
            let sample = if i % 2 == 0 { amp } else { -amp };
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }

    #[test]
    fn silence_is_zero_level() {
        let reading = analyze_batch(&vec![0u8; 200]);
        assert_eq!(reading.level, 0);
        assert!(!reading.clipping);
    }

    #[test]
    fn full_scale_samples_clip_and_force_high_level() {
        let mut bytes = Vec::new();
        for _ in 0..100 {
            bytes.extend_from_slice(&i16::MAX.to_le_bytes());
        }
        let reading = analyze_batch(&bytes);
        assert!(reading.clipping);
        assert!(reading.level >= 95);
    }

    #[test]
    fn loud_but_not_clipping_has_high_but_uncapped_level() {
        let bytes = samples_at(0.5, 200);
        let reading = analyze_batch(&bytes);
        assert!(!reading.clipping);
        assert!(reading.level > 0 && reading.level <= 100);
    }

    #[tokio::test]
    async fn emits_on_default_interval_then_drops_when_not_due() {
        let (tx, mut rx) = mpsc::channel(4);
        let meter = LevelMeter::new("s1".into(), "Coop".into(), tx);
        meter.observe(&samples_at(0.5, 50));
        let first = rx.try_recv();
        assert!(first.is_ok());
        // Immediately observing again should not be "due" yet.
        meter.observe(&samples_at(0.5, 50));
        assert!(rx.try_recv().is_err());
    }
}
