//! Telemetry sink seam: a narrow trait the Manager and its supervisors
//! report circuit-breaker, failure-reset, decoder-exit, and state-transition
//! events to, decoupling the core from any concrete metrics exporter. This
//! crate ships two trivial implementations: a null sink and one that logs
//! via `tracing`.

use crate::classifier::ErrorContext;
use crate::registry::SourceId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// One telemetry-worthy occurrence, attributed to a source where
/// applicable.
#[derive(Debug, Clone, Serialize)]
pub enum TelemetryEvent {
    CircuitOpened {
        source: SourceId,
        timestamp: DateTime<Utc>,
    },
    CircuitClosed {
        source: SourceId,
        timestamp: DateTime<Utc>,
    },
    ConditionalFailureReset {
        source: SourceId,
        timestamp: DateTime<Utc>,
    },
    DecoderExited {
        source: SourceId,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<ErrorContext>,
    },
    StateTransition {
        source: SourceId,
        from: String,
        to: String,
        reason: String,
    },
}

/// Narrow seam for telemetry export. Anything downstream of this crate
/// (metrics exporters, alerting) implements this trait; the core only
/// depends on it, never on a concrete exporter.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Drops every event. Used in tests and when no telemetry sink is wired.
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn record(&self, _event: TelemetryEvent) {}
}

/// Logs each event through `tracing` as a best-effort broadcast that
/// tolerates no subscribers.
pub struct LoggingTelemetrySink;

impl TelemetrySink for LoggingTelemetrySink {
    fn record(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::CircuitOpened { source, .. } => {
                warn!(source = %source, "circuit breaker opened");
            }
            TelemetryEvent::CircuitClosed { source, .. } => {
                info!(source = %source, "circuit breaker closed (cooldown elapsed)");
            }
            TelemetryEvent::ConditionalFailureReset { source, .. } => {
                info!(source = %source, "consecutive failure count reset after stable operation");
            }
            TelemetryEvent::DecoderExited { source, context } => {
                if let Some(ctx) = context {
                    warn!(source = %source, kind = ?ctx.kind, message = %ctx.user_message(), "decoder exited");
                } else {
                    warn!(source = %source, "decoder exited with unrecognized stderr");
                }
            }
            TelemetryEvent::StateTransition { source, from, to, reason } => {
                info!(source = %source, from, to, reason, "supervisor state transition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_any_event() {
        let sink = NullTelemetrySink;
        sink.record(TelemetryEvent::CircuitClosed {
            source: "rtsp_abc123".into(),
            timestamp: Utc::now(),
        });
    }
}
