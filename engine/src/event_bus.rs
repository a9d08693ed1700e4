use common::ObservabilityEvent;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Fan-out of observability events to any number of subscribers
///
/// Publishing never blocks; a subscriber that falls behind the buffer loses
/// the oldest events and is told how many it missed.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ObservabilityEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ObservabilityEvent) {
        debug!("Publishing {}: {:?}", event.name(), event);
        // No subscriber is not an error
        let _ = self.tx.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = ObservabilityEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObservabilityEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Write every event to the log at a level matching its severity
///
/// Returns the per-event-name counts once the bus is closed.
pub async fn run_event_logger(mut rx: broadcast::Receiver<ObservabilityEvent>) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    loop {
        match rx.recv().await {
            Ok(event) => {
                *counts.entry(event.name().to_string()).or_insert(0) += 1;
                log_event(&event);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event logger lagged behind the bus");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    counts
}

fn log_event(event: &ObservabilityEvent) {
    match event {
        ObservabilityEvent::InputRejected { instrument, reason, detail, .. } => {
            warn!(instrument = %instrument, reason = %reason, "Input rejected: {}", detail);
        }
        ObservabilityEvent::DetectorFault { detector, instrument, message, .. } => {
            warn!(detector = %detector, instrument = ?instrument, "Detector fault: {}", message);
        }
        ObservabilityEvent::ManipulationFlagged { instrument, kind, side, action, affected, metric, .. } => {
            warn!(
                instrument = %instrument,
                kind = %kind,
                side = ?side,
                action = ?action,
                affected,
                metric,
                "🚩 Manipulation flagged"
            );
        }
        ObservabilityEvent::CandidateSuppressed { pattern, instrument, reason, .. } => {
            debug!(pattern = %pattern, instrument = %instrument, reason = ?reason, "Candidate suppressed");
        }
        ObservabilityEvent::PendingRejected { pattern, instrument, reason, .. } => {
            info!(pattern = %pattern, instrument = %instrument, "Pending confirmation refused: {}", reason);
        }
        ObservabilityEvent::ConfirmationResolved { signal_id, pattern, instrument, outcome, .. } => {
            info!(
                signal_id = %signal_id,
                pattern = %pattern,
                instrument = %instrument,
                "Confirmation {}",
                outcome
            );
        }
        ObservabilityEvent::RiskRejected { signal_id, pattern, instrument, reason, .. } => {
            info!(signal_id = %signal_id, pattern = %pattern, instrument = %instrument, "Risk rejected: {}", reason);
        }
        ObservabilityEvent::CircuitBreaker { breaker, tripped: true, reason, until, .. } => {
            error!(breaker = %breaker, until = ?until, "🚨 Circuit breaker open: {}", reason);
        }
        ObservabilityEvent::CircuitBreaker { breaker, reason, .. } => {
            info!(breaker = %breaker, "✅ Circuit breaker cleared: {}", reason);
        }
        ObservabilityEvent::LadderRefreshed { reference_rate, pivot, levels, .. } => {
            info!(reference_rate = %reference_rate, pivot = %pivot, levels, "💱 Fair-value ladder refreshed");
        }
        ObservabilityEvent::LadderStale { error, usable, .. } => {
            warn!(usable, "Fair-value ladder stale: {}", error);
        }
        ObservabilityEvent::DailyReset { timestamp } => {
            info!(at = %timestamp, "📅 Daily risk reset");
        }
        ObservabilityEvent::RegimeChanged { instrument, regime, .. } => {
            info!(instrument = %instrument, regime = %regime, "Market regime changed");
        }
        ObservabilityEvent::SinkFailed { signal_id, pattern, instrument, error, .. } => {
            error!(signal_id = %signal_id, pattern = %pattern, instrument = %instrument, "Signal not written: {}", error);
        }
    }
}
