//! Fleet orchestrator: reconciles a configured list of source specs against
//! the set of live supervisors, adding, removing, and restarting supervisors
//! as the configuration changes.
//!
//! The Manager does not decide restart policy itself — it only wires
//! Stop/Start. Once started, all backoff/circuit-breaker/restart behavior is
//! driven entirely by the [`StreamSupervisor`].

use crate::buffers::{AnalysisParams, AnalysisRegistry, AnalysisRing, CaptureRegistry};
use crate::error::{IngestError, Result};
use crate::level::{AudioLevelData, LevelMeter};
use crate::registry::{RegisterOptions, RemovalOutcome, SharedRegistry, SourceId, SourceRegistry, SourceType};
use crate::supervisor::{StreamSupervisor, Transport};
use crate::telemetry::TelemetrySink;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Poll interval for the per-source analysis-buffer monitor task: one task
/// per source polls its analysis ring on this interval and delivers full
/// chunks to the detector.
const ANALYSIS_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One analysis-ring chunk delivered to the external detector, tagged by
/// the source it came from. The detector is an external collaborator; this
/// type is the push side of the channel it reads from.
#[derive(Debug, Clone)]
pub struct AnalysisChunk {
    pub source: SourceId,
    pub bytes: Vec<u8>,
}

/// Poll `ring` every 10ms and forward each full chunk to `tx`. Runs until
/// the channel's receiver is dropped or the task is aborted by teardown;
/// unlike the decoder's stdout/stderr readers, this task has no in-flight
/// state to flush, so abort-on-teardown (mirroring the binary's own
/// level-drain-task shutdown) is sufficient.
async fn run_analysis_monitor(source_id: SourceId, ring: Arc<AnalysisRing>, tx: mpsc::Sender<AnalysisChunk>) {
    let mut interval = tokio::time::interval(ANALYSIS_POLL_INTERVAL);
    loop {
        interval.tick().await;
        while let Some(bytes) = ring.read() {
            if tx
                .send(AnalysisChunk {
                    source: source_id.clone(),
                    bytes,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

/// One configured source, as handed to the Manager by the owning binary
/// (parsed from TOML by [`crate::config::TomlConfig`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub url: String,
    pub transport: Transport,
    pub display_name: String,
}

/// Audio/decoder parameters shared by every source: a minimal settings view
/// of RTSP URLs, transport, overlap seconds, sample rate, bit depth, and
/// capture-window duration.
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    pub sample_rate: u32,
    pub bit_depth: u32,
    pub overlap_seconds: f64,
    pub chunk_seconds: f64,
    pub capture_window_seconds: u64,
    pub analysis_ring_capacity: usize,
    pub level_channel_capacity: usize,
    pub chunk_channel_capacity: usize,
    pub stderr_capture_bytes: usize,
}

impl ManagerSettings {
    fn bytes_per_sample(&self) -> usize {
        (self.bit_depth / 8) as usize
    }

    fn chunk_size_bytes(&self) -> usize {
        (self.chunk_seconds * self.sample_rate as f64 * self.bytes_per_sample() as f64).round() as usize
    }
}

struct TrackedSource {
    spec: SourceSpec,
    source_id: SourceId,
    supervisor: Arc<StreamSupervisor>,
    task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

/// Diff between the previously-reconciled set of specs and a new one, keyed
/// by connection string (the natural identity of a source spec before it has
/// been registered). Computed by straightforward map comparison rather
/// than recomputing state from a stream of events.
struct Diff {
    added: Vec<SourceSpec>,
    removed: Vec<String>,
    changed: Vec<SourceSpec>,
}

fn diff_specs(current: &HashMap<String, SourceSpec>, desired: &[SourceSpec]) -> Diff {
    let desired_by_url: HashMap<&str, &SourceSpec> =
        desired.iter().map(|s| (s.url.as_str(), s)).collect();

    let mut added = Vec::new();
    let mut changed = Vec::new();
    for spec in desired {
        match current.get(&spec.url) {
            None => added.push(spec.clone()),
            Some(existing) if existing.transport != spec.transport => changed.push(spec.clone()),
            Some(_) => {}
        }
    }
    let removed: Vec<String> = current
        .keys()
        .filter(|url| !desired_by_url.contains_key(url.as_str()))
        .cloned()
        .collect();

    Diff { added, removed, changed }
}

/// Fleet orchestrator owning the lifecycle of every [`StreamSupervisor`].
pub struct Manager {
    registry: SharedRegistry,
    analysis_rings: Arc<AnalysisRegistry>,
    capture_rings: Arc<CaptureRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    settings: ManagerSettings,
    decoder_command: String,
    level_tx: mpsc::Sender<AudioLevelData>,
    chunk_tx: mpsc::Sender<AnalysisChunk>,
    tracked: AsyncMutex<HashMap<String, TrackedSource>>,
}

impl Manager {
    pub fn new(
        settings: ManagerSettings,
        decoder_command: String,
        telemetry: Arc<dyn TelemetrySink>,
        level_tx: mpsc::Sender<AudioLevelData>,
        chunk_tx: mpsc::Sender<AnalysisChunk>,
    ) -> Arc<Self> {
        Arc::new(Manager {
            registry: Arc::new(SourceRegistry::new()),
            analysis_rings: Arc::new(AnalysisRegistry::new()),
            capture_rings: Arc::new(CaptureRegistry::new()),
            telemetry,
            settings,
            decoder_command,
            level_tx,
            chunk_tx,
            tracked: AsyncMutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Reconcile the live fleet against `desired`: start supervisors for new
    /// specs, stop and tear down removed ones, and restart any whose
    /// transport changed. Invoked by the owning binary on startup and again
    /// on an explicit reload signal — no filesystem watching, which is a
    /// CLI/config-loading concern out of this crate's scope.
    pub async fn reconcile(&self, desired: &[SourceSpec]) -> Result<()> {
        let mut tracked = self.tracked.lock().await;
        let current: HashMap<String, SourceSpec> = tracked
            .values()
            .map(|t| (t.spec.url.clone(), t.spec.clone()))
            .collect();
        let diff = diff_specs(&current, desired);

        for url in &diff.removed {
            if let Some(t) = tracked.remove(url) {
                self.teardown(t).await;
            }
        }
        for spec in &diff.changed {
            if let Some(t) = tracked.remove(&spec.url) {
                self.teardown(t).await;
            }
            let tracked_source = self.spawn_source(spec.clone()).await?;
            tracked.insert(spec.url.clone(), tracked_source);
        }
        for spec in &diff.added {
            let tracked_source = self.spawn_source(spec.clone()).await?;
            tracked.insert(spec.url.clone(), tracked_source);
        }
        Ok(())
    }

    async fn spawn_source(&self, spec: SourceSpec) -> Result<TrackedSource> {
        let source = self.registry.register(
            &spec.url,
            RegisterOptions {
                id: None,
                display_name: Some(spec.display_name.clone()),
                source_type: Some(SourceType::Rtsp),
            },
        )?;
        let source_id = source.id.clone();
        self.registry.acquire_ref(&source_id)?;

        let params = AnalysisParams::new(
            self.settings.chunk_size_bytes(),
            self.settings.overlap_seconds,
            self.settings.sample_rate,
            self.settings.bytes_per_sample(),
        );
        if let Err(e) = self.analysis_rings.allocate(
            &source_id,
            self.settings.analysis_ring_capacity,
            params,
        ) {
            self.registry.release_ref(&source_id).ok();
            return Err(e);
        }
        if let Err(e) = self.capture_rings.allocate(
            &source_id,
            Duration::from_secs(self.settings.capture_window_seconds),
            self.settings.sample_rate,
            self.settings.bytes_per_sample(),
        ) {
            self.analysis_rings.remove(&source_id);
            self.registry.release_ref(&source_id).ok();
            return Err(e);
        }

        let analysis_ring = self.analysis_rings.get(&source_id).expect("just allocated");
        let capture_ring = self.capture_rings.get(&source_id).expect("just allocated");
        let level_meter = Arc::new(LevelMeter::new(
            source_id.clone(),
            spec.display_name.clone(),
            self.level_tx.clone(),
        ));

        let connection = source.connection_string()?.to_string();
        let supervisor = StreamSupervisor::new(
            source_id.clone(),
            spec.display_name.clone(),
            connection,
            spec.transport,
            self.decoder_command.clone(),
            self.settings.sample_rate,
            Arc::clone(&self.registry),
            analysis_ring,
            capture_ring,
            level_meter,
            Arc::clone(&self.telemetry),
            self.settings.stderr_capture_bytes,
        );

        let task_handle = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.run().await })
        };
        let monitor_handle = {
            let ring = self.analysis_rings.get(&source_id).expect("just allocated");
            let chunk_tx = self.chunk_tx.clone();
            let source_id = source_id.clone();
            tokio::spawn(run_analysis_monitor(source_id, ring, chunk_tx))
        };

        info!(source = %source_id, url = %source.safe_string, "source started");
        Ok(TrackedSource {
            spec,
            source_id,
            supervisor,
            task: task_handle,
            monitor_task: monitor_handle,
        })
    }

    async fn teardown(&self, tracked: TrackedSource) {
        tracked.supervisor.stop();
        tracked.monitor_task.abort();
        if let Err(e) = tracked.task.await {
            warn!(source = %tracked.source_id, error = %e, "supervisor task join failed during teardown");
        }

        let analysis = Arc::clone(&self.analysis_rings);
        let capture = Arc::clone(&self.capture_rings);
        let analysis_checker: &dyn Fn(&str) -> bool = &|id| analysis.contains(id);
        let capture_checker: &dyn Fn(&str) -> bool = &|id| capture.contains(id);

        self.analysis_rings.remove(&tracked.source_id);
        self.capture_rings.remove(&tracked.source_id);

        match self
            .registry
            .remove_if_unused(&tracked.source_id, &[analysis_checker, capture_checker])
        {
            Ok(RemovalOutcome::Removed) => {}
            Ok(RemovalOutcome::InUse) => {
                warn!(source = %tracked.source_id, "source still referenced after ring teardown");
            }
            Err(IngestError::NotFound(_)) => {}
            Err(e) => warn!(source = %tracked.source_id, error = %e, "remove_if_unused failed"),
        }
        info!(source = %tracked.source_id, "source stopped and torn down");
    }

    /// Stop every tracked supervisor and release its ring/registry
    /// allocations. Used for full-process shutdown.
    pub async fn shutdown(&self) {
        let mut tracked = self.tracked.lock().await;
        let all: Vec<TrackedSource> = tracked.drain().map(|(_, t)| t).collect();
        for t in all {
            self.teardown(t).await;
        }
    }

    /// Snapshot of health for every tracked source, keyed by source ID.
    pub async fn health_snapshot(&self) -> HashMap<SourceId, crate::supervisor::HealthSnapshot> {
        let tracked = self.tracked.lock().await;
        tracked
            .values()
            .map(|t| (t.source_id.clone(), t.supervisor.health()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(url: &str, transport: Transport) -> SourceSpec {
        SourceSpec {
            url: url.to_string(),
            transport,
            display_name: "Test".to_string(),
        }
    }

    #[test]
    fn diff_detects_added_removed_and_changed() {
        let mut current = HashMap::new();
        current.insert(
            "rtsp://a/stream".to_string(),
            spec("rtsp://a/stream", Transport::Tcp),
        );
        current.insert(
            "rtsp://b/stream".to_string(),
            spec("rtsp://b/stream", Transport::Tcp),
        );

        let desired = vec![
            spec("rtsp://a/stream", Transport::Udp), // changed transport
            spec("rtsp://c/stream", Transport::Tcp), // added
        ];

        let diff = diff_specs(&current, &desired);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].url, "rtsp://c/stream");
        assert_eq!(diff.removed, vec!["rtsp://b/stream".to_string()]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].url, "rtsp://a/stream");
    }

    #[test]
    fn diff_is_empty_when_nothing_changed() {
        let mut current = HashMap::new();
        current.insert(
            "rtsp://a/stream".to_string(),
            spec("rtsp://a/stream", Transport::Tcp),
        );
        let desired = vec![spec("rtsp://a/stream", Transport::Tcp)];
        let diff = diff_specs(&current, &desired);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.changed.is_empty());
    }

    #[tokio::test]
    async fn analysis_monitor_forwards_chunks_tagged_with_source_id() {
        let params = AnalysisParams {
            chunk_size: 10,
            overlap_size: 4,
        };
        let ring = Arc::new(AnalysisRing::new(1024, params));
        ring.write(&(0..64u8).collect::<Vec<u8>>()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_analysis_monitor("rtsp_abc123".to_string(), ring, tx));

        let chunk = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("monitor should deliver a chunk within the poll interval")
            .expect("channel should still be open");
        assert_eq!(chunk.source, "rtsp_abc123");
        assert_eq!(chunk.bytes.len(), 10);

        handle.abort();
    }
}
