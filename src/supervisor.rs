//! Stream supervisor: the per-source state machine that owns one decoder
//! process end to end — spawn, stdout → rings + level meter, stderr →
//! bounded capture, exit classification, backoff, circuit breaker, grace
//! period, watchdog, conditional failure reset.

use crate::buffers::{AnalysisRing, CaptureRing};
use crate::classifier::{classify, ErrorContext};
use crate::error::{IngestError, Result};
use crate::level::LevelMeter;
use crate::registry::{SharedRegistry, SourceId};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, info_span, warn, Instrument};

const STDOUT_READ_BUF_SIZE: usize = 65_535;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(120);

const GRACE_PERIOD: Duration = Duration::from_secs(30);
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);
const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CIRCUIT_COOLDOWN_POLL: Duration = Duration::from_secs(1);

/// Fixed cooldown applied after a circuit opens, long enough that a
/// misconfigured camera doesn't spin the supervisor hot (see DESIGN.md for
/// why five minutes).
const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(300);

const RAPID_FAILURE_WINDOW: Duration = Duration::from_secs(5);
const RAPID_FAILURE_THRESHOLD: u32 = 5;
const RESTART_COUNT_WINDOW: Duration = Duration::from_secs(60);

const CONDITIONAL_RESET_MIN_RUNTIME: Duration = Duration::from_secs(30);
const CONDITIONAL_RESET_MIN_BYTES: u64 = 100 * 1024;

/// Transition history is bounded so a flapping stream can't grow it
/// unboundedly.
const HISTORY_CAPACITY: usize = 100;
const HEALTH_HISTORY_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Starting,
    Running,
    Restarting,
    Backoff,
    CircuitOpen,
    Stopped,
}

impl StreamState {
    fn is_allowed_transition(from: StreamState, to: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (from, to),
            (Idle, Starting)
                | (Idle, Stopped)
                | (Idle, Idle)
                | (Starting, Running)
                | (Starting, Backoff)
                | (Starting, CircuitOpen)
                | (Starting, Stopped)
                | (Running, Restarting)
                | (Running, Backoff)
                | (Running, CircuitOpen)
                | (Running, Stopped)
                | (Restarting, Starting)
                | (Restarting, Backoff)
                | (Restarting, CircuitOpen)
                | (Restarting, Stopped)
                | (Backoff, Starting)
                | (Backoff, CircuitOpen)
                | (Backoff, Stopped)
                | (CircuitOpen, Starting)
                | (CircuitOpen, Stopped)
                | (Stopped, Stopped)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateTransitionRecord {
    pub from: StreamState,
    pub to: StreamState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    fn as_arg(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// `GetHealth()` snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub is_healthy: bool,
    pub is_receiving_data: bool,
    pub last_data_received: Option<DateTime<Utc>>,
    pub process_state: StreamState,
    pub state_history: Vec<StateTransitionRecord>,
    pub consecutive_failures: u64,
    pub total_bytes_received: u64,
    pub bytes_per_second: f64,
}

/// Everything a supervisor needs to drive one decoder process. Constructed
/// once by the Manager; destroyed after the terminal `Stopped` transition.
pub struct StreamSupervisor {
    pub source_id: SourceId,
    display_name: String,
    connection: String,
    transport: Transport,
    decoder_command: String,
    sample_rate: u32,

    registry: SharedRegistry,
    analysis: Arc<AnalysisRing>,
    capture: Arc<CaptureRing>,
    level_meter: Arc<LevelMeter>,
    telemetry: Arc<dyn TelemetrySink>,

    state: Mutex<StreamState>,
    history: Mutex<VecDeque<StateTransitionRecord>>,

    circuit_open_at: Mutex<Option<Instant>>,
    consecutive_failures: AtomicU64,
    rapid_failures: AtomicU64,
    restart_attempts: Mutex<VecDeque<Instant>>,
    backoff_delay: Mutex<Duration>,
    reset_done_this_run: AtomicBool,

    process_start_time: Mutex<Option<Instant>>,
    last_data_time: Mutex<Option<Instant>>,
    last_data_wall: Mutex<Option<DateTime<Utc>>>,
    stream_created_at: Instant,
    total_bytes_received: AtomicU64,

    /// Grace/watchdog/reset thresholds in milliseconds. Default to the
    /// fixed constants above; overridable only in tests (via
    /// [`StreamSupervisor::set_timings_for_test`]) so watchdog/reset
    /// scenarios don't require sleeping for real minutes.
    grace_period_ms: AtomicU64,
    watchdog_timeout_ms: AtomicU64,
    conditional_reset_min_runtime_ms: AtomicU64,

    /// Maximum bytes of decoder stderr retained for exit classification.
    stderr_capture_bytes: usize,

    restart_tx: mpsc::Sender<()>,
    restart_rx: AsyncMutex<mpsc::Receiver<()>>,
    stop_flag: AtomicBool,
    stop_notify: Notify,
}

enum DecoderOutcome {
    Exited { stderr: String },
    Cancelled,
}

impl StreamSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: SourceId,
        display_name: String,
        connection: String,
        transport: Transport,
        decoder_command: String,
        sample_rate: u32,
        registry: SharedRegistry,
        analysis: Arc<AnalysisRing>,
        capture: Arc<CaptureRing>,
        level_meter: Arc<LevelMeter>,
        telemetry: Arc<dyn TelemetrySink>,
        stderr_capture_bytes: usize,
    ) -> Arc<Self> {
        let (restart_tx, restart_rx) = mpsc::channel(1);
        Arc::new(StreamSupervisor {
            source_id,
            display_name,
            connection,
            transport,
            decoder_command,
            sample_rate,
            registry,
            analysis,
            capture,
            level_meter,
            telemetry,
            state: Mutex::new(StreamState::Idle),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            circuit_open_at: Mutex::new(None),
            consecutive_failures: AtomicU64::new(0),
            rapid_failures: AtomicU64::new(0),
            restart_attempts: Mutex::new(VecDeque::new()),
            backoff_delay: Mutex::new(INITIAL_BACKOFF),
            reset_done_this_run: AtomicBool::new(false),
            process_start_time: Mutex::new(None),
            last_data_time: Mutex::new(None),
            last_data_wall: Mutex::new(None),
            stream_created_at: Instant::now(),
            total_bytes_received: AtomicU64::new(0),
            grace_period_ms: AtomicU64::new(GRACE_PERIOD.as_millis() as u64),
            watchdog_timeout_ms: AtomicU64::new(WATCHDOG_TIMEOUT.as_millis() as u64),
            conditional_reset_min_runtime_ms: AtomicU64::new(CONDITIONAL_RESET_MIN_RUNTIME.as_millis() as u64),
            stderr_capture_bytes,
            restart_tx,
            restart_rx: AsyncMutex::new(restart_rx),
            stop_flag: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }

    fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms.load(Ordering::Relaxed))
    }

    fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms.load(Ordering::Relaxed))
    }

    fn conditional_reset_min_runtime(&self) -> Duration {
        Duration::from_millis(self.conditional_reset_min_runtime_ms.load(Ordering::Relaxed))
    }

    /// Override grace/watchdog/reset thresholds for deterministic tests.
    /// Never called in production; the real daemon always runs the
    /// spec-fixed 30s/60s/30s values.
    #[cfg(test)]
    pub fn set_timings_for_test(&self, grace: Duration, watchdog: Duration, reset_runtime: Duration) {
        self.grace_period_ms.store(grace.as_millis() as u64, Ordering::Relaxed);
        self.watchdog_timeout_ms.store(watchdog.as_millis() as u64, Ordering::Relaxed);
        self.conditional_reset_min_runtime_ms
            .store(reset_runtime.as_millis() as u64, Ordering::Relaxed);
    }

    /// Bounded copy of the full transition history.
    pub fn state_history(&self) -> Vec<StateTransitionRecord> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    fn transition(&self, to: StreamState, reason: impl Into<String>) -> StreamState {
        let reason = reason.into();
        let mut guard = self.state.lock().unwrap();
        let from = *guard;

        // Stopped is terminal: any non-idempotent request is silently dropped.
        if from == StreamState::Stopped {
            return StreamState::Stopped;
        }
        // Idempotent same-state transitions are dropped to reduce log noise.
        if to == from {
            return from;
        }
        if !StreamState::is_allowed_transition(from, to) {
            debug!(?from, ?to, reason = %reason, "applying invalid transition leniently");
        }
        *guard = to;
        drop(guard);

        let mut history = self.history.lock().unwrap();
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(StateTransitionRecord {
            from,
            to,
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        drop(history);

        self.telemetry.record(TelemetryEvent::StateTransition {
            source: self.source_id.clone(),
            from: format!("{from:?}"),
            to: format!("{to:?}"),
            reason,
        });
        to
    }

    fn build_args(&self) -> Vec<String> {
        vec![
            "-rtsp_transport".to_string(),
            self.transport.as_arg().to_string(),
            "-i".to_string(),
            self.connection.clone(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-vn".to_string(),
            "-f".to_string(),
            "s16le".to_string(),
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-ac".to_string(),
            "1".to_string(),
            "pipe:1".to_string(),
        ]
    }

    /// Request a restart; coalesces with any pending signal (capacity-1
    /// channel, so a flood of requests collapses to one pending restart).
    pub fn signal_restart(&self) {
        let _ = self.restart_tx.try_send(());
    }

    /// Idempotent stop request: transitions to `Stopped`, cancels the
    /// decoder child, and wakes any waiter.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
    }

    fn is_stopping(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    async fn wait_for_stop(&self) {
        loop {
            if self.is_stopping() {
                return;
            }
            self.stop_notify.notified().await;
        }
    }

    async fn wait_for_restart_signal(&self) {
        let mut rx = self.restart_rx.lock().await;
        rx.recv().await;
    }

    fn is_circuit_open(&self) -> bool {
        let mut guard = self.circuit_open_at.lock().unwrap();
        match *guard {
            None => false,
            Some(opened) => {
                if opened.elapsed() >= CIRCUIT_COOLDOWN {
                    *guard = None;
                    drop(guard);
                    self.consecutive_failures.store(0, Ordering::Release);
                    self.rapid_failures.store(0, Ordering::Release);
                    self.telemetry.record(TelemetryEvent::CircuitClosed {
                        source: self.source_id.clone(),
                        timestamp: Utc::now(),
                    });
                    false
                } else {
                    true
                }
            }
        }
    }

    fn open_circuit(&self) {
        *self.circuit_open_at.lock().unwrap() = Some(Instant::now());
        self.telemetry.record(TelemetryEvent::CircuitOpened {
            source: self.source_id.clone(),
            timestamp: Utc::now(),
        });
    }

    async fn wait_circuit_cooldown_or_stop(&self) {
        loop {
            if self.is_stopping() || !self.is_circuit_open() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(CIRCUIT_COOLDOWN_POLL) => {}
                _ = self.wait_for_stop() => return,
            }
        }
    }

    fn next_backoff_delay(&self) -> Duration {
        let mut guard = self.backoff_delay.lock().unwrap();
        let current = *guard;
        *guard = (current * 2).min(MAX_BACKOFF);
        // +/-20% jitter, always non-negative.
        let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered = current.as_secs_f64() * (1.0 + jitter_frac);
        Duration::from_secs_f64(jittered.max(0.1))
    }

    fn reset_backoff(&self) {
        *self.backoff_delay.lock().unwrap() = INITIAL_BACKOFF;
    }

    async fn wait_backoff_or_signal(&self) {
        let delay = self.next_backoff_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.wait_for_restart_signal() => {}
            _ = self.wait_for_stop() => {}
        }
    }

    fn record_restart_attempt(&self) -> u64 {
        let mut attempts = self.restart_attempts.lock().unwrap();
        let now = Instant::now();
        attempts.push_back(now);
        while let Some(front) = attempts.front() {
            if now.duration_since(*front) > RESTART_COUNT_WINDOW {
                attempts.pop_front();
            } else {
                break;
            }
        }
        attempts.len() as u64
    }

    async fn ingest_batch(&self, bytes: &[u8]) {
        if let Err(e) = self.analysis.write(bytes).await {
            warn!(source = %self.source_id, error = %e, "analysis ring write failed");
        }
        self.capture.write(bytes);
        self.level_meter.observe(bytes);

        let now = Instant::now();
        *self.last_data_time.lock().unwrap() = Some(now);
        *self.last_data_wall.lock().unwrap() = Some(Utc::now());
        self.total_bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        let _ = self
            .registry
            .update_metrics(&self.source_id, bytes.len() as u64, false);
    }

    fn check_watchdog_and_conditional_reset(&self) {
        if self.state() != StreamState::Running {
            return;
        }
        let in_grace = self.stream_created_at.elapsed() < self.grace_period();
        if !in_grace {
            let stale = match *self.last_data_time.lock().unwrap() {
                Some(t) => t.elapsed() > self.watchdog_timeout(),
                None => true,
            };
            if stale {
                self.signal_restart();
            }
        }

        if self.reset_done_this_run.load(Ordering::Acquire) {
            return;
        }
        let runtime = self
            .process_start_time
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let bytes = self.total_bytes_received.load(Ordering::Relaxed);
        if runtime >= self.conditional_reset_min_runtime() && bytes >= CONDITIONAL_RESET_MIN_BYTES {
            self.consecutive_failures.store(0, Ordering::Release);
            self.rapid_failures.store(0, Ordering::Release);
            self.reset_backoff();
            self.reset_done_this_run.store(true, Ordering::Release);
            self.telemetry.record(TelemetryEvent::ConditionalFailureReset {
                source: self.source_id.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    async fn handle_exit(&self, stderr: String) {
        let ctx = classify(&stderr);
        self.registry
            .update_metrics(&self.source_id, 0, true)
            .ok();
        self.telemetry.record(TelemetryEvent::DecoderExited {
            source: self.source_id.clone(),
            context: ctx.clone(),
        });

        let runtime = self
            .process_start_time
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let rapid_count = if runtime < RAPID_FAILURE_WINDOW {
            self.rapid_failures.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.rapid_failures.store(0, Ordering::Release);
            0
        };
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        self.record_restart_attempt();

        let classifier_wants_open = ctx.as_ref().is_some_and(ErrorContext::should_open_circuit);
        if rapid_count >= RAPID_FAILURE_THRESHOLD as u64 || classifier_wants_open {
            self.open_circuit();
            let reason = ctx
                .as_ref()
                .map(|c| format!("decoder exit classified as {:?}", c.kind))
                .unwrap_or_else(|| "rapid repeated failures".to_string());
            self.transition(StreamState::CircuitOpen, reason);
            return;
        }

        if ctx.as_ref().is_some_and(ErrorContext::should_restart) {
            self.transition(StreamState::Restarting, "decoder exit is restartable");
            self.transition(StreamState::Backoff, "backing off before restart");
            return;
        }

        self.transition(StreamState::Backoff, "unrecognized decoder exit, backing off");
    }

    async fn run_decoder_once(self: &Arc<Self>) -> DecoderOutcome {
        let args = self.build_args();
        let mut child = match Command::new(&self.decoder_command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return DecoderOutcome::Exited {
                    stderr: format!("failed to spawn decoder process: {e}"),
                };
            }
        };

        self.transition(StreamState::Running, "decoder process started");
        self.reset_done_this_run.store(false, Ordering::Release);

        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");
        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

        let stdout_task = {
            let this = Arc::clone(self);
            let mut cancel_rx = cancel_rx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; STDOUT_READ_BUF_SIZE];
                loop {
                    tokio::select! {
                        _ = cancel_rx.changed() => break,
                        result = stdout.read(&mut buf) => {
                            match result {
                                Ok(0) | Err(_) => break,
                                Ok(n) => this.ingest_batch(&buf[..n]).await,
                            }
                        }
                    }
                }
            })
        };

        let stderr_capture_bytes = self.stderr_capture_bytes;
        let stderr_task = tokio::spawn(async move {
            let mut ring: Vec<u8> = Vec::new();
            let mut buf = vec![0u8; stderr_capture_bytes];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        ring.extend_from_slice(&buf[..n]);
                        if ring.len() > stderr_capture_bytes {
                            let excess = ring.len() - stderr_capture_bytes;
                            ring.drain(0..excess);
                        }
                    }
                }
            }
            String::from_utf8_lossy(&ring).into_owned()
        });

        let watchdog_task = {
            let this = Arc::clone(self);
            let mut cancel_rx = cancel_rx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(WATCHDOG_POLL_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel_rx.changed() => break,
                        _ = interval.tick() => this.check_watchdog_and_conditional_reset(),
                    }
                }
            })
        };

        let outcome = tokio::select! {
            status = child.wait() => {
                let _ = status;
                None
            }
            _ = self.wait_for_restart_signal() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
            _ = self.wait_for_stop() => {
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(10), child.wait()).await;
                Some(DecoderOutcome::Cancelled)
            }
        };

        let _ = cancel_tx.send(true);
        let _ = stdout_task.await;
        let _ = watchdog_task.await;
        let stderr_out = stderr_task.await.unwrap_or_default();

        outcome.unwrap_or(DecoderOutcome::Exited { stderr: stderr_out })
    }

    async fn run_inner(self: Arc<Self>) {
        loop {
            if self.is_stopping() {
                self.transition(StreamState::Stopped, "stop requested");
                return;
            }
            if self.is_circuit_open() {
                self.transition(StreamState::CircuitOpen, "circuit is open");
                self.wait_circuit_cooldown_or_stop().await;
                continue;
            }

            self.transition(StreamState::Starting, "beginning start attempt");
            *self.process_start_time.lock().unwrap() = Some(Instant::now());

            match self.run_decoder_once().await {
                DecoderOutcome::Cancelled => {
                    self.transition(StreamState::Stopped, "stop requested during run");
                    return;
                }
                DecoderOutcome::Exited { stderr } => {
                    self.handle_exit(stderr).await;
                }
            }

            if self.state() == StreamState::Backoff {
                self.wait_backoff_or_signal().await;
            }
        }
    }

    /// Drive this supervisor until it reaches the terminal `Stopped`
    /// state. Intended to be spawned as one long-running task per source.
    pub async fn run(self: Arc<Self>) {
        let span = info_span!(
            "stream_supervisor",
            source_id = %self.source_id,
            display_name = %self.display_name,
        );
        let this = Arc::clone(&self);
        this.run_inner().instrument(span).await;
    }

    pub fn health(&self) -> HealthSnapshot {
        let last_data_wall = *self.last_data_wall.lock().unwrap();
        let recent = match *self.last_data_time.lock().unwrap() {
            Some(t) => t.elapsed() <= self.watchdog_timeout(),
            None => false,
        };
        let has_data = last_data_wall.is_some();
        let in_grace = self.stream_created_at.elapsed() < self.grace_period();
        let grace_without_data = in_grace && !has_data;
        let is_healthy = recent && !grace_without_data;

        let is_receiving_data = match *self.last_data_time.lock().unwrap() {
            Some(t) => t.elapsed() <= Duration::from_secs(5),
            None => false,
        };

        let history = self.history.lock().unwrap();
        let recent_history: Vec<StateTransitionRecord> = history
            .iter()
            .rev()
            .take(HEALTH_HISTORY_WINDOW)
            .rev()
            .cloned()
            .collect();

        let total_bytes_received = self.total_bytes_received.load(Ordering::Relaxed);
        let bytes_per_second = self.data_rate(total_bytes_received);

        HealthSnapshot {
            is_healthy,
            is_receiving_data,
            last_data_received: last_data_wall,
            process_state: self.state(),
            state_history: recent_history,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_bytes_received,
            bytes_per_second,
        }
    }

    /// Running-average throughput since the current process started, in
    /// bytes/second. Zero while no process has been spawned yet.
    fn data_rate(&self, total_bytes_received: u64) -> f64 {
        let started = *self.process_start_time.lock().unwrap();
        match started {
            Some(t) => {
                let elapsed = t.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    total_bytes_received as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::{AnalysisParams, AnalysisRing, CaptureRing};
    use crate::level::LevelMeter;
    use crate::registry::SourceRegistry;
    use crate::telemetry::NullTelemetrySink;

    fn make_supervisor() -> Arc<StreamSupervisor> {
        let registry = Arc::new(SourceRegistry::new());
        let analysis = Arc::new(AnalysisRing::new(
            1 << 20,
            AnalysisParams {
                chunk_size: 1024,
                overlap_size: 256,
            },
        ));
        let capture = Arc::new(CaptureRing::new(Duration::from_secs(5), 48000, 2));
        let (tx, _rx) = mpsc::channel(8);
        let level = Arc::new(LevelMeter::new("s1".into(), "Test".into(), tx));
        StreamSupervisor::new(
            "rtsp_test0001".to_string(),
            "Test Camera".to_string(),
            "rtsp://127.0.0.1:554/stream".to_string(),
            Transport::Tcp,
            "ffmpeg".to_string(),
            48000,
            registry,
            analysis,
            capture,
            level,
            Arc::new(NullTelemetrySink),
            4096,
        )
    }

    #[test]
    fn stopped_is_terminal_and_history_stops_growing() {
        let sup = make_supervisor();
        assert_eq!(sup.transition(StreamState::Stopped, "stop"), StreamState::Stopped);
        assert_eq!(sup.state_history().len(), 1);
        assert_eq!(sup.transition(StreamState::Starting, "ignored"), StreamState::Stopped);
        assert_eq!(sup.state_history().len(), 1);
        assert_eq!(sup.state(), StreamState::Stopped);
    }

    #[test]
    fn idempotent_same_state_transition_is_not_recorded() {
        let sup = make_supervisor();
        sup.transition(StreamState::Starting, "go");
        assert_eq!(sup.state_history().len(), 1);
        sup.transition(StreamState::Starting, "go again");
        assert_eq!(sup.state_history().len(), 1);
    }

    #[test]
    fn invalid_transition_is_applied_leniently() {
        let sup = make_supervisor();
        // Idle -> Running is not in the allowed table but must still apply.
        let result = sup.transition(StreamState::Running, "race");
        assert_eq!(result, StreamState::Running);
        assert_eq!(sup.state(), StreamState::Running);
        assert_eq!(sup.state_history().len(), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let sup = make_supervisor();
        sup.stop();
        sup.stop();
        assert!(sup.is_stopping());
    }

    #[test]
    fn circuit_breaker_blocks_until_cooldown() {
        let sup = make_supervisor();
        assert!(!sup.is_circuit_open());
        sup.open_circuit();
        assert!(sup.is_circuit_open());
    }

    #[tokio::test]
    async fn watchdog_fires_once_grace_has_expired_and_data_is_stale() {
        let sup = make_supervisor();
        sup.set_timings_for_test(Duration::from_millis(5), Duration::from_millis(20), Duration::from_secs(9999));
        sup.transition(StreamState::Running, "test running");
        *sup.process_start_time.lock().unwrap() = Some(Instant::now());
        *sup.last_data_time.lock().unwrap() = Some(Instant::now() - Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(10)).await;

        sup.check_watchdog_and_conditional_reset();

        let mut rx = sup.restart_rx.lock().await;
        assert!(rx.try_recv().is_ok(), "watchdog should have signalled a restart");
    }

    #[tokio::test]
    async fn watchdog_does_not_fire_while_still_in_grace() {
        let sup = make_supervisor();
        sup.set_timings_for_test(Duration::from_secs(9999), Duration::from_millis(1), Duration::from_secs(9999));
        sup.transition(StreamState::Running, "test running");
        *sup.process_start_time.lock().unwrap() = Some(Instant::now());
        *sup.last_data_time.lock().unwrap() = Some(Instant::now() - Duration::from_millis(100));

        sup.check_watchdog_and_conditional_reset();

        let mut rx = sup.restart_rx.lock().await;
        assert!(rx.try_recv().is_err(), "grace period should suppress the watchdog");
    }

    #[tokio::test]
    async fn conditional_reset_clears_failures_after_stable_runtime_and_bytes() {
        let sup = make_supervisor();
        sup.set_timings_for_test(Duration::from_secs(9999), Duration::from_secs(9999), Duration::from_millis(10));
        sup.transition(StreamState::Running, "test running");
        *sup.process_start_time.lock().unwrap() = Some(Instant::now() - Duration::from_millis(50));
        sup.total_bytes_received.store(150 * 1024, Ordering::Relaxed);
        sup.consecutive_failures.store(7, Ordering::Relaxed);

        sup.check_watchdog_and_conditional_reset();

        assert_eq!(sup.consecutive_failures.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn conditional_reset_does_not_fire_before_minimum_runtime() {
        let sup = make_supervisor();
        sup.set_timings_for_test(Duration::from_secs(9999), Duration::from_secs(9999), Duration::from_secs(30));
        sup.transition(StreamState::Running, "test running");
        *sup.process_start_time.lock().unwrap() = Some(Instant::now() - Duration::from_millis(15));
        sup.total_bytes_received.store(200 * 1024, Ordering::Relaxed);
        sup.consecutive_failures.store(7, Ordering::Relaxed);

        sup.check_watchdog_and_conditional_reset();

        assert_eq!(sup.consecutive_failures.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn health_reports_zero_rate_before_any_process_has_started() {
        let sup = make_supervisor();
        assert_eq!(sup.health().bytes_per_second, 0.0);
    }

    #[tokio::test]
    async fn health_reports_nonzero_rate_once_bytes_flow_after_start() {
        let sup = make_supervisor();
        *sup.process_start_time.lock().unwrap() = Some(Instant::now() - Duration::from_millis(100));
        sup.total_bytes_received.store(48_000, Ordering::Relaxed);

        let snapshot = sup.health();

        assert!(snapshot.bytes_per_second > 0.0);
        assert_eq!(snapshot.total_bytes_received, 48_000);
    }
}
